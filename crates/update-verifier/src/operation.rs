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

use dashmap::DashSet;

use crate::clock::Clock;
use crate::device::{DeviceController, GateDecision, PolicyGate, StartResponse, with_rpc_timeout};
use crate::error::{ControllerError, RejectReason, TransportError};
use crate::model::{DeviceId, OperationRecord, UpdateRequest, UpdateState};

/// Devices with an update in flight from this process.
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    devices: Arc<DashSet<DeviceId>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `device_id`, or returns `None` if it is already claimed.
    pub fn claim(&self, device_id: &DeviceId) -> Option<InFlightGuard> {
        self.devices.insert(device_id.clone()).then(|| InFlightGuard {
            devices: self.devices.clone(),
            device_id: device_id.clone(),
        })
    }

    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.devices.contains(device_id)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Releases the claim on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    devices: Arc<DashSet<DeviceId>>,
    device_id: DeviceId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.devices.remove(&self.device_id);
    }
}

/// An accepted update. The device stays claimed while this is alive.
#[derive(Debug)]
pub struct ActiveOperation {
    pub record: OperationRecord,
    _guard: InFlightGuard,
}

impl ActiveOperation {
    pub fn into_record(self) -> OperationRecord {
        self.record
    }
}

#[derive(Debug)]
pub enum StartOutcome {
    Accepted(ActiveOperation),
    Rejected(RejectReason),
}

/// Starts firmware updates after checking the device is idle and allowed to
/// update.
#[derive(Clone)]
pub struct OperationController {
    controller: Arc<dyn DeviceController>,
    gate: Arc<dyn PolicyGate>,
    clock: Arc<dyn Clock>,
    in_flight: InFlightRegistry,
    rpc_timeout: Duration,
}

impl OperationController {
    pub fn new(
        controller: Arc<dyn DeviceController>,
        gate: Arc<dyn PolicyGate>,
        clock: Arc<dyn Clock>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            controller,
            gate,
            clock,
            in_flight: InFlightRegistry::new(),
            rpc_timeout,
        }
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    /// Issues the start request for `request`. Only transport failures are
    /// errors; every refusal is an `Ok(StartOutcome::Rejected(_))`.
    pub async fn start_update(
        &self,
        request: &UpdateRequest,
    ) -> Result<StartOutcome, TransportError> {
        let device_id = &request.device_id;

        if let Err(reason) = request.validate() {
            return Ok(reject(device_id, reason));
        }

        let Some(guard) = self.in_flight.claim(device_id) else {
            return Ok(reject(device_id, RejectReason::DeviceBusy));
        };

        let status = match with_rpc_timeout(
            self.clock.as_ref(),
            device_id,
            "get_firmware_status",
            self.rpc_timeout,
            self.controller.get_firmware_status(device_id),
        )
        .await
        {
            Ok(status) => status,
            Err(e) => return rejection_or_transport(device_id, e),
        };
        if !status.acknowledged {
            return Ok(reject(
                device_id,
                RejectReason::DeviceUnavailable("status query was not acknowledged".to_string()),
            ));
        }
        if status.state == UpdateState::InProgress {
            return Ok(reject(device_id, RejectReason::DeviceBusy));
        }

        match with_rpc_timeout(
            self.clock.as_ref(),
            device_id,
            "is_update_allowed",
            self.rpc_timeout,
            self.gate.is_update_allowed(device_id),
        )
        .await
        {
            Ok(GateDecision::Allowed) => {}
            Ok(GateDecision::Denied { diagnostic }) => {
                return Ok(reject(device_id, RejectReason::FeatureGated(diagnostic)));
            }
            Err(e) => return rejection_or_transport(device_id, e),
        }

        match with_rpc_timeout(
            self.clock.as_ref(),
            device_id,
            "start_firmware_update",
            self.rpc_timeout,
            self.controller
                .start_firmware_update(device_id, &request.image, request.slot),
        )
        .await
        {
            Ok(StartResponse::Accepted) => {}
            Ok(StartResponse::Rejected(reason)) => return Ok(reject(device_id, reason)),
            Err(e) => return rejection_or_transport(device_id, e),
        }

        tracing::info!(
            %device_id,
            slot = %request.slot,
            image = %request.image,
            revision_before = %status.revision,
            "Firmware update accepted"
        );
        Ok(StartOutcome::Accepted(ActiveOperation {
            record: OperationRecord::in_progress(device_id.clone(), request.slot, status.revision),
            _guard: guard,
        }))
    }
}

fn reject(device_id: &DeviceId, reason: RejectReason) -> StartOutcome {
    tracing::warn!(%device_id, %reason, "Firmware update rejected");
    StartOutcome::Rejected(reason)
}

fn rejection_or_transport(
    device_id: &DeviceId,
    error: ControllerError,
) -> Result<StartOutcome, TransportError> {
    match error {
        ControllerError::DeviceUnavailable(detail) => {
            Ok(reject(device_id, RejectReason::DeviceUnavailable(detail)))
        }
        ControllerError::AuthorizationDenied(detail) => {
            Ok(reject(device_id, RejectReason::AuthorizationDenied(detail)))
        }
        ControllerError::Transport(e) => {
            tracing::warn!(%device_id, error = %e, "Device controller transport failure");
            Err(e)
        }
    }
}
