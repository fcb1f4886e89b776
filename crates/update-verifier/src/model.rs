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

use serde::{Deserialize, Serialize};

use crate::error::RejectReason;

/// Identifies a managed device, e.g. a power supply slot in a chassis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    PowerSupply,
    Blade,
    Fan,
}

impl DeviceKind {
    /// Only devices carrying a primary and a secondary firmware image can be
    /// verified by this crate.
    pub fn has_dual_slot_firmware(self) -> bool {
        matches!(self, DeviceKind::PowerSupply)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::PowerSupply => "power_supply",
            DeviceKind::Blade => "blade",
            DeviceKind::Fan => "fan",
        };
        f.write_str(name)
    }
}

/// The firmware image targeted by an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    #[default]
    Primary,
    Secondary,
}

impl Slot {
    /// Revision segments that an update of this slot must leave untouched.
    pub fn protected_segments(self) -> &'static [usize] {
        match self {
            Slot::Primary => &[0, 2],
            Slot::Secondary => &[0, 1],
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Primary => f.write_str("primary"),
            Slot::Secondary => f.write_str("secondary"),
        }
    }
}

/// Opaque reference to a firmware image (path or blob identifier) understood
/// by the device controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(image: impl Into<String>) -> Self {
        Self(image.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn validate(&self) -> Result<(), RejectReason> {
        if self.0.is_empty() {
            return Err(RejectReason::InvalidParameter(
                "image reference is empty".to_string(),
            ));
        }
        if self
            .0
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(RejectReason::InvalidParameter(format!(
                "image reference {:?} contains whitespace or control characters",
                self.0
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single attempt to reflash one slot of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub device_id: DeviceId,
    pub kind: DeviceKind,
    pub slot: Slot,
    pub image: ImageRef,
}

impl UpdateRequest {
    pub fn new(device_id: DeviceId, kind: DeviceKind, slot: Slot, image: ImageRef) -> Self {
        Self {
            device_id,
            kind,
            slot,
            image,
        }
    }

    pub fn validate(&self) -> Result<(), RejectReason> {
        if !self.kind.has_dual_slot_firmware() {
            return Err(RejectReason::InvalidParameter(format!(
                "{} devices do not expose dual-slot firmware",
                self.kind
            )));
        }
        self.image.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    #[default]
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
}

impl UpdateState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UpdateState::Succeeded | UpdateState::Failed)
    }

    /// Position in the `NotStarted -> InProgress -> terminal` progression.
    pub(crate) fn rank(self) -> u8 {
        match self {
            UpdateState::NotStarted => 0,
            UpdateState::InProgress => 1,
            UpdateState::Succeeded | UpdateState::Failed => 2,
        }
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateState::NotStarted => "not_started",
            UpdateState::InProgress => "in_progress",
            UpdateState::Succeeded => "succeeded",
            UpdateState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Firmware status as reported by the device controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareStatus {
    /// Completion indicator of the status query itself. A device that is busy
    /// reflashing may answer without a usable status.
    pub acknowledged: bool,
    pub state: UpdateState,
    pub stage: String,
    pub revision: String,
}

impl FirmwareStatus {
    pub fn new(state: UpdateState, stage: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            acknowledged: true,
            state,
            stage: stage.into(),
            revision: revision.into(),
        }
    }

    pub fn unacknowledged() -> Self {
        Self {
            acknowledged: false,
            state: UpdateState::NotStarted,
            stage: String::new(),
            revision: String::new(),
        }
    }
}

/// One status sample taken while polling an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResult {
    pub sequence: u32,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub acknowledged: bool,
    pub state: UpdateState,
    pub stage: String,
    pub revision: String,
}

impl PollResult {
    pub fn from_status(sequence: u32, elapsed: Duration, status: FirmwareStatus) -> Self {
        Self {
            sequence,
            elapsed,
            acknowledged: status.acknowledged,
            state: status.state,
            stage: status.stage,
            revision: status.revision,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.acknowledged && self.state.is_terminal()
    }
}

/// Tracks one accepted update from the pre-check until the batch finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationRecord {
    pub device_id: DeviceId,
    pub slot: Slot,
    pub state: UpdateState,
    pub stage: String,
    pub revision_before: String,
    pub revision_after: Option<String>,
    pub samples: Vec<PollResult>,
}

impl OperationRecord {
    pub fn in_progress(device_id: DeviceId, slot: Slot, revision_before: String) -> Self {
        Self {
            device_id,
            slot,
            state: UpdateState::InProgress,
            stage: String::new(),
            revision_before,
            revision_after: None,
            samples: Vec::new(),
        }
    }

    /// Appends a sample to the history. Unacknowledged samples are kept for
    /// triage but do not change the recorded state.
    pub fn observe(&mut self, sample: PollResult) {
        if sample.acknowledged {
            self.state = sample.state;
            self.stage.clone_from(&sample.stage);
            self.revision_after = Some(sample.revision.clone());
        }
        self.samples.push(sample);
    }

    pub fn last_elapsed(&self) -> Duration {
        self.samples
            .last()
            .map(|sample| sample.elapsed)
            .unwrap_or_default()
    }
}
