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

use std::time::Duration;

use serde::Serialize;

use crate::model::DeviceId;

/// The device controller itself could not be reached. Never a firmware
/// defect.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{operation} for {device_id} timed out after {timeout:?}")]
    Timeout {
        device_id: DeviceId,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("device controller unreachable: {0}")]
    Unreachable(String),
}

/// Typed failures returned by the device controller collaborators.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Why an update was not started. Local to one device and not retried within
/// the same run.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("device busy: an update is already in progress")]
    DeviceBusy,

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// Carries the policy gate's diagnostic verbatim.
    #[error("{0}")]
    FeatureGated(String),
}

/// Refusals raised before any device of a batch is contacted.
#[derive(thiserror::Error, Debug)]
pub enum BatchError {
    #[error("batch contains no devices")]
    EmptyBatch,

    #[error("device {0} appears more than once in the batch")]
    DuplicateDevice(DeviceId),

    #[error(
        "selecting {selected} of {available} available devices leaves fewer than {minimum_reserve} in reserve"
    )]
    ReserveViolation {
        selected: usize,
        available: usize,
        minimum_reserve: usize,
    },

    #[error("invalid batch parameters: {0}")]
    InvalidParameters(String),

    #[error("inventory query failed: {0}")]
    Inventory(#[source] TransportError),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}
