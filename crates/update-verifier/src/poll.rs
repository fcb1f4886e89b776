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

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::clock::{Clock, elapsed_since};
use crate::device::{DeviceController, with_rpc_timeout};
use crate::error::ControllerError;
use crate::model::{DeviceId, FirmwareStatus, PollResult, UpdateState};

/// Cadence of status queries for one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Wait before the first status query.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Minimum spacing between two status queries.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// No status query is issued later than this after polling began.
    #[serde(with = "humantime_serde")]
    pub budget: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5 * 60),
            interval: Duration::from_secs(7 * 60),
            budget: Duration::from_secs(12 * 60),
        }
    }
}

impl PollPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("poll interval must be greater than zero".to_string());
        }
        if self.budget.is_zero() {
            return Err("poll budget must be greater than zero".to_string());
        }
        if self.initial_delay > self.budget {
            return Err(format!(
                "initial poll delay {} exceeds the poll budget {}",
                humantime::format_duration(self.initial_delay),
                humantime::format_duration(self.budget)
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTermination {
    Terminal(UpdateState),
    BudgetExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollHistory {
    pub samples: Vec<PollResult>,
    pub termination: PollTermination,
}

#[derive(thiserror::Error, Debug)]
#[error("polling {device_id} failed after {} sample(s): {source}", .samples.len())]
pub struct PollError {
    pub device_id: DeviceId,
    pub samples: Vec<PollResult>,
    #[source]
    pub source: ControllerError,
}

struct PollCursor {
    start: Instant,
    deadline: Instant,
    next_tick: Instant,
    sequence: u32,
    finished: bool,
}

/// Issues status queries for a device on a fixed cadence.
#[derive(Clone)]
pub struct PollScheduler {
    controller: Arc<dyn DeviceController>,
    clock: Arc<dyn Clock>,
    rpc_timeout: Duration,
}

impl PollScheduler {
    pub fn new(
        controller: Arc<dyn DeviceController>,
        clock: Arc<dyn Clock>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            controller,
            clock,
            rpc_timeout,
        }
    }

    /// Takes one sample. A device that reports itself unavailable while it
    /// reboots into the new image yields an unacknowledged sample.
    pub async fn sample(
        &self,
        device_id: &DeviceId,
        sequence: u32,
        elapsed: Duration,
    ) -> Result<PollResult, ControllerError> {
        let status = with_rpc_timeout(
            self.clock.as_ref(),
            device_id,
            "get_firmware_status",
            self.rpc_timeout,
            self.controller.get_firmware_status(device_id),
        )
        .await;

        let status = match status {
            Ok(status) => status,
            Err(ControllerError::DeviceUnavailable(detail)) => {
                tracing::debug!(%device_id, sequence, %detail, "Device did not answer status query");
                FirmwareStatus::unacknowledged()
            }
            Err(e) => return Err(e),
        };

        let sample = PollResult::from_status(sequence, elapsed, status);
        tracing::debug!(
            %device_id,
            sequence,
            elapsed = %humantime::format_duration(elapsed),
            acknowledged = sample.acknowledged,
            state = %sample.state,
            stage = %sample.stage,
            revision = %sample.revision,
            "Firmware status sample"
        );
        Ok(sample)
    }

    /// Lazily samples `device_id` according to `policy`. The stream starts
    /// its own timeline when created and ends after an acknowledged terminal
    /// sample, after the first error, or once the next tick would fall past
    /// the budget.
    pub fn samples(
        &self,
        device_id: DeviceId,
        policy: PollPolicy,
    ) -> impl Stream<Item = Result<PollResult, ControllerError>> + Send + 'static {
        let start = self.clock.now();
        let cursor = PollCursor {
            start,
            deadline: start + policy.budget,
            next_tick: start + policy.initial_delay,
            sequence: 0,
            finished: false,
        };
        let scheduler = self.clone();

        stream::unfold(cursor, move |mut cursor| {
            let scheduler = scheduler.clone();
            let device_id = device_id.clone();
            async move {
                if cursor.finished || cursor.next_tick > cursor.deadline {
                    return None;
                }

                let tick = cursor.next_tick;
                scheduler.clock.sleep_until(tick).await;
                let elapsed = elapsed_since(scheduler.clock.as_ref(), cursor.start);
                let result = scheduler
                    .sample(&device_id, cursor.sequence, elapsed)
                    .await;

                match &result {
                    Ok(sample) => cursor.finished = sample.is_terminal(),
                    Err(_) => cursor.finished = true,
                }
                cursor.sequence += 1;
                // A slow query pushes the cadence back instead of bunching
                // the following sample up against it.
                cursor.next_tick = (tick + policy.interval).max(scheduler.clock.now());
                Some((result, cursor))
            }
        })
    }

    /// Polls until a terminal state or the end of the budget.
    pub async fn wait_for_terminal(
        &self,
        device_id: &DeviceId,
        policy: PollPolicy,
    ) -> Result<PollHistory, PollError> {
        let mut stream = std::pin::pin!(self.samples(device_id.clone(), policy));
        let mut samples = Vec::new();

        while let Some(result) = stream.next().await {
            match result {
                Ok(sample) => {
                    let terminal = sample.is_terminal().then_some(sample.state);
                    samples.push(sample);
                    if let Some(state) = terminal {
                        return Ok(PollHistory {
                            samples,
                            termination: PollTermination::Terminal(state),
                        });
                    }
                }
                Err(source) => {
                    return Err(PollError {
                        device_id: device_id.clone(),
                        samples,
                        source,
                    });
                }
            }
        }

        Ok(PollHistory {
            samples,
            termination: PollTermination::BudgetExhausted,
        })
    }
}
