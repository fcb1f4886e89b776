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

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use update_verifier::revision::{REVISION_SEGMENTS, REVISION_SEPARATOR};
use update_verifier::{
    Clock, ControllerError, DeviceController, DeviceId, DeviceKind, FirmwareStatus, GateDecision,
    ImageRef, Inventory, PolicyGate, RejectReason, Slot, StageCatalog, StartResponse,
    TransportError, UpdateState,
};

use crate::fleet::{Behavior, DeviceSpec, FleetConfig};

struct ActiveUpdate {
    started_at: Instant,
    target_revision: String,
}

struct SimulatedDevice {
    spec: DeviceSpec,
    revision: String,
    update: Option<ActiveUpdate>,
    start_calls: usize,
    status_calls: usize,
}

/// In-memory chassis manager. Firmware progress is derived from the shared
/// clock, so a paused or accelerated clock drives every device.
pub struct SimulatedChassis {
    clock: Arc<dyn Clock>,
    stage_duration: Duration,
    stages: StageCatalog,
    devices: Mutex<Vec<SimulatedDevice>>,
}

impl SimulatedChassis {
    pub fn new(fleet: FleetConfig, clock: Arc<dyn Clock>) -> Self {
        let devices = fleet
            .devices
            .into_iter()
            .map(|spec| SimulatedDevice {
                revision: spec.revision.clone(),
                spec,
                update: None,
                start_calls: 0,
                status_calls: 0,
            })
            .collect();
        Self {
            clock,
            stage_duration: fleet.stage_duration,
            stages: fleet.stages,
            devices: Mutex::new(devices),
        }
    }

    /// Number of start requests received for `device_id`.
    pub fn start_calls(&self, device_id: &DeviceId) -> usize {
        self.devices()
            .iter()
            .find(|device| &device.spec.id == device_id)
            .map_or(0, |device| device.start_calls)
    }

    pub fn status_calls(&self, device_id: &DeviceId) -> usize {
        self.devices()
            .iter()
            .find(|device| &device.spec.id == device_id)
            .map_or(0, |device| device.status_calls)
    }

    /// Last settled revision of `device_id`.
    pub fn revision(&self, device_id: &DeviceId) -> Option<String> {
        self.devices()
            .iter()
            .find(|device| &device.spec.id == device_id)
            .map(|device| device.revision.clone())
    }

    fn devices(&self) -> MutexGuard<'_, Vec<SimulatedDevice>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stage(&self, ordinal: usize) -> String {
        self.stages
            .stages()
            .get(ordinal)
            .cloned()
            .unwrap_or_default()
    }

    fn progress(&self, device: &mut SimulatedDevice, now: Instant) -> FirmwareStatus {
        let Some(update) = &device.update else {
            return FirmwareStatus::new(UpdateState::NotStarted, "", device.revision.clone());
        };
        if device.spec.behavior == Behavior::NeverStarts {
            return FirmwareStatus::new(UpdateState::NotStarted, "", device.revision.clone());
        }

        let elapsed = now.saturating_duration_since(update.started_at);
        let step = (elapsed.as_nanos() / self.stage_duration.as_nanos().max(1)) as usize;
        let completion = self.stages.stages().len().saturating_sub(1);
        let current = device.revision.clone();

        let (state, ordinal, revision) = match &device.spec.behavior {
            Behavior::FailAt { stage } => {
                let failed_at = self.stages.ordinal(stage).unwrap_or_default();
                if step >= failed_at {
                    (UpdateState::Failed, failed_at, current)
                } else {
                    (UpdateState::InProgress, step, current)
                }
            }
            Behavior::StuckAt { stage } => {
                let stuck_at = self.stages.ordinal(stage).unwrap_or_default();
                (UpdateState::InProgress, step.min(stuck_at), current)
            }
            Behavior::RegressStage => {
                (UpdateState::InProgress, step % completion.max(1), current)
            }
            Behavior::PrematureSuccess if step >= 1 => (
                UpdateState::Succeeded,
                completion.min(1),
                update.target_revision.clone(),
            ),
            _ if step >= completion => (
                UpdateState::Succeeded,
                completion,
                update.target_revision.clone(),
            ),
            _ => (UpdateState::InProgress, step, current),
        };

        if state == UpdateState::Succeeded {
            device.revision.clone_from(&revision);
        }
        FirmwareStatus::new(state, self.stage(ordinal), revision)
    }
}

/// Increments the numeric revision segment `index`, keeping its width.
/// Revisions that are not `A.B.C` numbers are returned unchanged.
pub fn bump_segment(revision: &str, index: usize) -> String {
    let mut segments: Vec<String> = revision
        .split(REVISION_SEPARATOR)
        .map(str::to_string)
        .collect();
    if segments.len() != REVISION_SEGMENTS {
        return revision.to_string();
    }
    let Some(segment) = segments.get_mut(index) else {
        return revision.to_string();
    };
    let Ok(value) = segment.parse::<u64>() else {
        return revision.to_string();
    };
    let width = segment.len();
    *segment = format!("{:0width$}", value + 1);
    segments.join(&REVISION_SEPARATOR.to_string())
}

fn updated_segment(slot: Slot) -> usize {
    match slot {
        Slot::Primary => 1,
        Slot::Secondary => 2,
    }
}

#[async_trait]
impl DeviceController for SimulatedChassis {
    async fn start_firmware_update(
        &self,
        device_id: &DeviceId,
        image: &ImageRef,
        slot: Slot,
    ) -> Result<StartResponse, ControllerError> {
        let now = self.clock.now();
        let mut devices = self.devices();
        let Some(device) = devices.iter_mut().find(|device| &device.spec.id == device_id) else {
            return Err(ControllerError::DeviceUnavailable(format!(
                "{device_id} is not part of this chassis"
            )));
        };
        device.start_calls += 1;

        match &device.spec.behavior {
            Behavior::Unreachable => {
                return Err(TransportError::Unreachable(format!(
                    "no route to controller of {device_id}"
                ))
                .into());
            }
            _ if !device.spec.present => {
                return Err(ControllerError::DeviceUnavailable(format!(
                    "{device_id} is not present"
                )));
            }
            Behavior::Unauthorized => {
                return Err(ControllerError::AuthorizationDenied(format!(
                    "caller may not update firmware on {device_id}"
                )));
            }
            Behavior::Gated { diagnostic } => {
                return Ok(StartResponse::Rejected(RejectReason::FeatureGated(
                    diagnostic.clone(),
                )));
            }
            Behavior::Busy => return Ok(StartResponse::Rejected(RejectReason::DeviceBusy)),
            _ => {}
        }

        if self.progress(device, now).state == UpdateState::InProgress {
            return Ok(StartResponse::Rejected(RejectReason::DeviceBusy));
        }

        let mut target_revision = bump_segment(&device.revision, updated_segment(slot));
        if device.spec.behavior == Behavior::CorruptRevision {
            target_revision = bump_segment(&target_revision, 0);
        }
        tracing::debug!(
            %device_id,
            %slot,
            %image,
            revision = %device.revision,
            %target_revision,
            "Simulated firmware update started"
        );
        device.update = Some(ActiveUpdate {
            started_at: now,
            target_revision,
        });
        Ok(StartResponse::Accepted)
    }

    async fn get_firmware_status(
        &self,
        device_id: &DeviceId,
    ) -> Result<FirmwareStatus, ControllerError> {
        let now = self.clock.now();
        let mut devices = self.devices();
        let Some(device) = devices.iter_mut().find(|device| &device.spec.id == device_id) else {
            return Err(ControllerError::DeviceUnavailable(format!(
                "{device_id} is not part of this chassis"
            )));
        };
        device.status_calls += 1;

        if device.spec.behavior == Behavior::Unreachable {
            return Err(TransportError::Unreachable(format!(
                "no route to controller of {device_id}"
            ))
            .into());
        }
        if !device.spec.present {
            return Err(ControllerError::DeviceUnavailable(format!(
                "{device_id} is not present"
            )));
        }
        if device.spec.behavior == Behavior::Busy {
            return Ok(FirmwareStatus::new(
                UpdateState::InProgress,
                self.stage(1),
                device.revision.clone(),
            ));
        }

        Ok(self.progress(device, now))
    }
}

#[async_trait]
impl PolicyGate for SimulatedChassis {
    async fn is_update_allowed(
        &self,
        device_id: &DeviceId,
    ) -> Result<GateDecision, ControllerError> {
        let devices = self.devices();
        match devices
            .iter()
            .find(|device| &device.spec.id == device_id)
            .map(|device| &device.spec.behavior)
        {
            Some(Behavior::Gated { diagnostic }) => Ok(GateDecision::Denied {
                diagnostic: diagnostic.clone(),
            }),
            _ => Ok(GateDecision::Allowed),
        }
    }
}

#[async_trait]
impl Inventory for SimulatedChassis {
    async fn available_devices(&self, kind: DeviceKind) -> Result<Vec<DeviceId>, TransportError> {
        Ok(self
            .devices()
            .iter()
            .filter(|device| device.spec.present && device.spec.kind == kind)
            .map(|device| device.spec.id.clone())
            .collect())
    }
}
