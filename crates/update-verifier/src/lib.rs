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

//! Out-of-band verification of dual-slot firmware updates.
//!
//! A [`BatchCoordinator`] starts one update per device through the
//! [`OperationController`], samples its progress with the [`PollScheduler`],
//! classifies the samples with the [`StageVerifier`] and checks the final
//! revision with the [`RevisionInvariantChecker`].

pub mod batch;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod model;
pub mod operation;
pub mod poll;
pub mod revision;
pub mod stage;

#[cfg(test)]
mod test_util;

// Re-export commonly used types
pub use batch::{BatchCoordinator, BatchReport, DeviceOutcome, FailureReason, Verdict};
pub use clock::{Clock, ScaledClock, TokioClock};
pub use config::VerifierConfig;
pub use device::{
    DeviceController, GateDecision, Inventory, OpenGate, PolicyGate, StartResponse,
};
pub use error::{BatchError, ConfigError, ControllerError, RejectReason, TransportError};
pub use model::{
    DeviceId, DeviceKind, FirmwareStatus, ImageRef, OperationRecord, PollResult, Slot,
    UpdateRequest, UpdateState,
};
pub use operation::{OperationController, StartOutcome};
pub use poll::{PollPolicy, PollScheduler};
pub use revision::{RevisionCheck, RevisionInvariantChecker};
pub use stage::{StageCatalog, StageVerdict, StageVerifier, StageViolation};
