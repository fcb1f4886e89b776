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

// Collaborator boundaries consumed by the verifier. Transport, discovery and
// policy decisions live behind these traits.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::clock::Clock;
use crate::error::{ControllerError, RejectReason, TransportError};
use crate::model::{DeviceId, DeviceKind, FirmwareStatus, ImageRef, Slot};

/// Answer of the device controller to a start-update request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartResponse {
    Accepted,
    Rejected(RejectReason),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeviceController: Send + Sync {
    async fn start_firmware_update(
        &self,
        device_id: &DeviceId,
        image: &ImageRef,
        slot: Slot,
    ) -> Result<StartResponse, ControllerError>;

    async fn get_firmware_status(
        &self,
        device_id: &DeviceId,
    ) -> Result<FirmwareStatus, ControllerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    /// The diagnostic is surfaced to callers unchanged.
    Denied { diagnostic: String },
}

/// External feature gate deciding whether a device may be updated at all.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyGate: Send + Sync {
    async fn is_update_allowed(&self, device_id: &DeviceId)
    -> Result<GateDecision, ControllerError>;
}

/// A gate that allows every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenGate;

#[async_trait]
impl PolicyGate for OpenGate {
    async fn is_update_allowed(
        &self,
        _device_id: &DeviceId,
    ) -> Result<GateDecision, ControllerError> {
        Ok(GateDecision::Allowed)
    }
}

/// Device discovery and reserve-capacity selection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn available_devices(&self, kind: DeviceKind) -> Result<Vec<DeviceId>, TransportError>;

    /// Picks up to `count` devices of `kind`, leaving at least
    /// `minimum_reserve` available devices unselected. The default takes the
    /// first devices listed by [`Inventory::available_devices`].
    async fn select_devices(
        &self,
        kind: DeviceKind,
        count: usize,
        minimum_reserve: usize,
    ) -> Result<Vec<DeviceId>, TransportError> {
        let available = self.available_devices(kind).await?;
        let selectable = available.len().saturating_sub(minimum_reserve);
        Ok(available.into_iter().take(count.min(selectable)).collect())
    }
}

/// Bounds a single remote call by `timeout`, measured on `clock` like every
/// other wait.
pub(crate) async fn with_rpc_timeout<T, F>(
    clock: &dyn Clock,
    device_id: &DeviceId,
    operation: &'static str,
    timeout: Duration,
    call: F,
) -> Result<T, ControllerError>
where
    F: Future<Output = Result<T, ControllerError>>,
{
    let deadline = clock.now() + timeout;
    tokio::select! {
        biased;
        result = call => result,
        () = clock.sleep_until(deadline) => Err(TransportError::Timeout {
            device_id: device_id.clone(),
            operation,
            timeout,
        }
        .into()),
    }
}
