/*
 * SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Source of time for polling. Everything that waits goes through a clock so
/// that multi-minute schedules can run on virtual or accelerated time.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;

    async fn sleep_until(&self, deadline: Instant);
}

/// Tokio's timer. Under `tokio::time::pause` this is a virtual clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

/// Runs simulated time `factor` times faster than the wall clock. Used for
/// dry runs against simulated devices.
#[derive(Debug, Clone, Copy)]
pub struct ScaledClock {
    origin: Instant,
    factor: u32,
}

impl ScaledClock {
    pub fn new(factor: u32) -> Self {
        Self {
            origin: Instant::now(),
            factor: factor.max(1),
        }
    }
}

#[async_trait]
impl Clock for ScaledClock {
    fn now(&self) -> Instant {
        self.origin + self.origin.elapsed() * self.factor
    }

    async fn sleep_until(&self, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(self.now());
        if !remaining.is_zero() {
            tokio::time::sleep(remaining / self.factor).await;
        }
    }
}

/// Elapsed time between two clock readings, saturating at zero.
pub fn elapsed_since(clock: &dyn Clock, start: Instant) -> Duration {
    clock.now().saturating_duration_since(start)
}
