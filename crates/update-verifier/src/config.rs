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

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::DeviceKind;
use crate::poll::PollPolicy;
use crate::stage::StageCatalog;

/// Environment variables with this prefix override file settings, e.g.
/// `FW_VERIFY__POLL__BUDGET=20m`.
pub const ENV_PREFIX: &str = "FW_VERIFY__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Kind of device selected from the inventory.
    pub device_kind: DeviceKind,
    /// Number of devices selected when no explicit list is given.
    pub batch_size: usize,
    /// Available devices that must stay out of a batch.
    pub minimum_reserve: usize,
    /// Upper bound on devices concurrently in the start phase. Polling is
    /// not limited.
    pub max_concurrency: usize,
    /// Bound on every individual remote call.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    pub poll: PollPolicy,
    pub stages: StageCatalog,
    /// Report an update still running at the end of the poll budget as
    /// failed instead of timed out.
    pub strict_deadline: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            device_kind: DeviceKind::PowerSupply,
            batch_size: 1,
            minimum_reserve: 1,
            max_concurrency: 8,
            rpc_timeout: Duration::from_secs(30),
            poll: PollPolicy::default(),
            stages: StageCatalog::default(),
            strict_deadline: false,
        }
    }
}

impl VerifierConfig {
    /// Load configuration from optional path
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(VerifierConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: VerifierConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.minimum_reserve == 0 {
            return Err(ConfigError::Invalid(
                "minimum_reserve must be at least 1".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrency must be greater than 0".to_string(),
            ));
        }
        if self.rpc_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "rpc_timeout must be greater than 0".to_string(),
            ));
        }
        self.poll.validate().map_err(ConfigError::Invalid)?;
        self.stages.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }
}
