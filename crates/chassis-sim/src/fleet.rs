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

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use update_verifier::{DeviceId, DeviceKind, StageCatalog};

#[derive(thiserror::Error, Debug)]
pub enum FleetError {
    #[error("Failed to read fleet file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse fleet: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid fleet: {0}")]
    Invalid(String),
}

/// How a simulated device reacts to a firmware update.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Behavior {
    /// Walks through every stage and completes with the slot's revision
    /// segment bumped.
    #[default]
    Healthy,
    /// Reports `Failed` once it reaches `stage`.
    FailAt { stage: String },
    /// Never leaves `stage`.
    StuckAt { stage: String },
    /// Restarts from the first stage instead of completing.
    RegressStage,
    /// Completes, but also changes a segment the slot does not own.
    CorruptRevision,
    /// Reports success one stage after starting, before completion.
    PrematureSuccess,
    /// Accepts the start request but keeps reporting `NotStarted`.
    NeverStarts,
    /// Already running an update started elsewhere.
    Busy,
    /// Denied by the policy gate with `diagnostic`.
    Gated { diagnostic: String },
    /// The caller's role may not start updates.
    Unauthorized,
    /// The device controller does not answer.
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: DeviceId,
    #[serde(default)]
    pub kind: DeviceKind,
    pub revision: String,
    /// Absent devices are not listed by the inventory.
    #[serde(default = "default_present")]
    pub present: bool,
    #[serde(default)]
    pub behavior: Behavior,
}

fn default_present() -> bool {
    true
}

impl DeviceSpec {
    pub fn new(id: &str, revision: &str, behavior: Behavior) -> Self {
        Self {
            id: DeviceId::new(id),
            kind: DeviceKind::PowerSupply,
            revision: revision.to_string(),
            present: true,
            behavior,
        }
    }

    pub fn absent(mut self) -> Self {
        self.present = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Simulated time a device spends in each stage.
    #[serde(with = "humantime_serde", default = "default_stage_duration")]
    pub stage_duration: Duration,
    #[serde(default)]
    pub stages: StageCatalog,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

fn default_stage_duration() -> Duration {
    Duration::from_secs(2 * 60)
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            stage_duration: default_stage_duration(),
            stages: StageCatalog::default(),
            devices: Vec::new(),
        }
    }
}

impl FleetConfig {
    pub fn with_devices(devices: Vec<DeviceSpec>) -> Self {
        Self {
            devices,
            ..Default::default()
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, FleetError> {
        let fleet: FleetConfig = toml::from_str(content)?;
        fleet.validate()?;
        Ok(fleet)
    }

    pub fn load(path: &Path) -> Result<Self, FleetError> {
        let content = std::fs::read_to_string(path).map_err(|source| FleetError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if self.stage_duration.is_zero() {
            return Err(FleetError::Invalid(
                "stage_duration must be greater than 0".to_string(),
            ));
        }
        self.stages.validate().map_err(FleetError::Invalid)?;

        let mut ids = HashSet::new();
        for device in &self.devices {
            if !ids.insert(&device.id) {
                return Err(FleetError::Invalid(format!(
                    "device {} is listed more than once",
                    device.id
                )));
            }
            if let Behavior::FailAt { stage } | Behavior::StuckAt { stage } = &device.behavior
                && self.stages.ordinal(stage).is_none()
            {
                return Err(FleetError::Invalid(format!(
                    "device {} refers to unknown stage {stage:?}",
                    device.id
                )));
            }
        }
        Ok(())
    }
}
