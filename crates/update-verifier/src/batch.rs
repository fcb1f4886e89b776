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

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::clock::Clock;
use crate::config::VerifierConfig;
use crate::device::{DeviceController, Inventory, PolicyGate};
use crate::error::{BatchError, ControllerError, RejectReason};
use crate::model::{DeviceId, OperationRecord, UpdateRequest, UpdateState};
use crate::operation::{OperationController, StartOutcome};
use crate::poll::{PollPolicy, PollScheduler};
use crate::revision::{RevisionCheck, RevisionInvariantChecker};
use crate::stage::{StageCatalog, StageMachine, StageVerdict, StageViolation};

/// Why a device failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Stage { violation: StageViolation },
    UpdateFailed { stage: String },
    RevisionInvariant { detail: String },
    DeadlineExceeded { state: UpdateState, stage: String },
    Transport { detail: String },
    Interrupted { detail: String },
}

impl FailureReason {
    /// The failure says nothing about the firmware itself.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            FailureReason::Transport { .. } | FailureReason::Interrupted { .. }
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Stage { violation } => write!(f, "stage violation: {violation}"),
            FailureReason::UpdateFailed { stage } => {
                write!(f, "update failed during stage {stage:?}")
            }
            FailureReason::RevisionInvariant { detail } => {
                write!(f, "revision invariant violated: {detail}")
            }
            FailureReason::DeadlineExceeded { state, stage } => write!(
                f,
                "update still {state} at stage {stage:?} when the poll budget ran out"
            ),
            FailureReason::Transport { detail } => write!(f, "transport failure: {detail}"),
            FailureReason::Interrupted { detail } => write!(f, "interrupted: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed(FailureReason),
    Skipped(RejectReason),
    TimedOut,
}

impl Verdict {
    pub fn is_passed(&self) -> bool {
        matches!(self, Verdict::Passed)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Verdict::Skipped(_))
    }

    pub fn is_infrastructure_failure(&self) -> bool {
        matches!(self, Verdict::Failed(reason) if reason.is_infrastructure())
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Passed => "passed",
            Verdict::Failed(_) => "failed",
            Verdict::Skipped(_) => "skipped",
            Verdict::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceOutcome {
    pub verdict: Verdict,
    pub diagnostic: String,
    pub record: Option<OperationRecord>,
}

impl DeviceOutcome {
    fn passed(record: OperationRecord) -> Self {
        let diagnostic = format!(
            "{} update completed at stage {:?}, revision {} -> {}",
            record.slot,
            record.stage,
            record.revision_before,
            record.revision_after.as_deref().unwrap_or_default()
        );
        Self {
            verdict: Verdict::Passed,
            diagnostic,
            record: Some(record),
        }
    }

    fn failed(reason: FailureReason, record: Option<OperationRecord>) -> Self {
        Self {
            diagnostic: reason.to_string(),
            verdict: Verdict::Failed(reason),
            record,
        }
    }

    fn skipped(reason: RejectReason) -> Self {
        Self {
            diagnostic: reason.to_string(),
            verdict: Verdict::Skipped(reason),
            record: None,
        }
    }

    fn timed_out(record: OperationRecord) -> Self {
        let diagnostic = format!(
            "no terminal status after {}, last seen {} at stage {:?}",
            humantime::format_duration(record.last_elapsed()),
            record.state,
            record.stage
        );
        Self {
            verdict: Verdict::TimedOut,
            diagnostic,
            record: Some(record),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerdictCounts {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub timed_out: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// `true` when every device that was not skipped passed.
    pub result: bool,
    pub outcomes: BTreeMap<DeviceId, DeviceOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    fn new(outcomes: BTreeMap<DeviceId, DeviceOutcome>, started_at: DateTime<Utc>) -> Self {
        let result = outcomes
            .values()
            .filter(|outcome| !outcome.verdict.is_skipped())
            .all(|outcome| outcome.verdict.is_passed());
        Self {
            result,
            outcomes,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn counts(&self) -> VerdictCounts {
        let mut counts = VerdictCounts::default();
        for outcome in self.outcomes.values() {
            match outcome.verdict {
                Verdict::Passed => counts.passed += 1,
                Verdict::Failed(_) => counts.failed += 1,
                Verdict::Skipped(_) => counts.skipped += 1,
                Verdict::TimedOut => counts.timed_out += 1,
            }
        }
        counts
    }

    /// Devices whose failure came from the harness or the transport rather
    /// than the firmware.
    pub fn infrastructure_failures(&self) -> Vec<&DeviceId> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.verdict.is_infrastructure_failure())
            .map(|(device_id, _)| device_id)
            .collect()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = self.counts();
        writeln!(
            f,
            "batch {}: {} passed, {} failed, {} timed out, {} skipped",
            if self.result { "PASSED" } else { "FAILED" },
            counts.passed,
            counts.failed,
            counts.timed_out,
            counts.skipped
        )?;
        for (device_id, outcome) in &self.outcomes {
            writeln!(
                f,
                "  {device_id}: {} - {}",
                outcome.verdict.label(),
                outcome.diagnostic
            )?;
        }
        Ok(())
    }
}

/// Everything a single device pipeline needs. Cloned into each task.
#[derive(Clone)]
struct Pipeline {
    operations: OperationController,
    scheduler: PollScheduler,
    catalog: StageCatalog,
    policy: PollPolicy,
    strict_deadline: bool,
    start_limiter: Arc<Semaphore>,
}

impl Pipeline {
    async fn run(self, request: UpdateRequest) -> DeviceOutcome {
        let started = {
            let _permit = match self.start_limiter.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    return DeviceOutcome::failed(
                        FailureReason::Interrupted {
                            detail: e.to_string(),
                        },
                        None,
                    );
                }
            };
            self.operations.start_update(&request).await
        };

        let mut operation = match started {
            Ok(StartOutcome::Accepted(operation)) => operation,
            Ok(StartOutcome::Rejected(reason)) => return DeviceOutcome::skipped(reason),
            Err(e) => {
                return DeviceOutcome::failed(
                    FailureReason::Transport {
                        detail: e.to_string(),
                    },
                    None,
                );
            }
        };

        let mut machine = StageMachine::new(&self.catalog);
        let mut samples = std::pin::pin!(
            self.scheduler
                .samples(request.device_id.clone(), self.policy)
        );

        while let Some(result) = samples.next().await {
            let sample = match result {
                Ok(sample) => sample,
                Err(ControllerError::AuthorizationDenied(detail)) => {
                    let reason = FailureReason::Interrupted {
                        detail: format!("authorization lost while polling: {detail}"),
                    };
                    tracing::warn!(%reason, "Polling interrupted");
                    return DeviceOutcome::failed(reason, Some(operation.into_record()));
                }
                Err(e) => {
                    let reason = FailureReason::Transport {
                        detail: e.to_string(),
                    };
                    tracing::warn!(%reason, "Polling failed");
                    return DeviceOutcome::failed(reason, Some(operation.into_record()));
                }
            };

            let observed = machine.observe(&sample);
            operation.record.observe(sample);
            if let Err(violation) = observed {
                tracing::warn!(%violation, "Stage violation, polling stopped");
                return DeviceOutcome::failed(
                    FailureReason::Stage { violation },
                    Some(operation.into_record()),
                );
            }
        }

        let outcome = self.conclude(machine.verdict(), operation.into_record());
        tracing::info!(
            verdict = outcome.verdict.label(),
            diagnostic = %outcome.diagnostic,
            "Device verified"
        );
        outcome
    }

    fn conclude(&self, verdict: StageVerdict, record: OperationRecord) -> DeviceOutcome {
        match verdict {
            StageVerdict::Succeeded { .. } => {
                let revision_after = record.revision_after.as_deref().unwrap_or_default();
                match RevisionInvariantChecker::check(
                    &record.revision_before,
                    revision_after,
                    record.slot,
                ) {
                    RevisionCheck::Passed => DeviceOutcome::passed(record),
                    RevisionCheck::Violated(detail) => DeviceOutcome::failed(
                        FailureReason::RevisionInvariant { detail },
                        Some(record),
                    ),
                }
            }
            StageVerdict::Failed { stage } => {
                DeviceOutcome::failed(FailureReason::UpdateFailed { stage }, Some(record))
            }
            StageVerdict::Pending { state, stage } if self.strict_deadline => {
                DeviceOutcome::failed(
                    FailureReason::DeadlineExceeded {
                        state,
                        stage: stage.unwrap_or_default(),
                    },
                    Some(record),
                )
            }
            StageVerdict::Pending { .. } => DeviceOutcome::timed_out(record),
            StageVerdict::Violation(violation) => {
                DeviceOutcome::failed(FailureReason::Stage { violation }, Some(record))
            }
        }
    }
}

/// Gives every spawned device an outcome, even when its task ended without
/// one that could be matched back to it.
fn report_lost_pipelines(
    outcomes: &mut BTreeMap<DeviceId, DeviceOutcome>,
    spawned: impl IntoIterator<Item = DeviceId>,
) {
    for device_id in spawned {
        outcomes.entry(device_id).or_insert_with_key(|device_id| {
            tracing::error!(%device_id, "Device pipeline ended without an outcome");
            DeviceOutcome::failed(
                FailureReason::Interrupted {
                    detail: "verification task ended without reporting an outcome".to_string(),
                },
                None,
            )
        });
    }
}

/// Runs verified firmware updates over a set of devices concurrently.
pub struct BatchCoordinator {
    operations: OperationController,
    scheduler: PollScheduler,
    inventory: Arc<dyn Inventory>,
    config: VerifierConfig,
}

impl BatchCoordinator {
    pub fn new(
        controller: Arc<dyn DeviceController>,
        gate: Arc<dyn PolicyGate>,
        inventory: Arc<dyn Inventory>,
        clock: Arc<dyn Clock>,
        config: VerifierConfig,
    ) -> Self {
        Self {
            operations: OperationController::new(
                controller.clone(),
                gate,
                clock.clone(),
                config.rpc_timeout,
            ),
            scheduler: PollScheduler::new(controller, clock, config.rpc_timeout),
            inventory,
            config,
        }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Selects `count` devices of the configured kind from the inventory and
    /// runs a batch over them with the configured poll policy.
    pub async fn select_and_run<F>(
        &self,
        count: usize,
        request_factory: F,
    ) -> Result<BatchReport, BatchError>
    where
        F: Fn(&DeviceId) -> UpdateRequest,
    {
        if self.config.minimum_reserve == 0 {
            return Err(BatchError::InvalidParameters(
                "minimum_reserve must be at least 1".to_string(),
            ));
        }
        let devices = self
            .inventory
            .select_devices(self.config.device_kind, count, self.config.minimum_reserve)
            .await
            .map_err(BatchError::Inventory)?;
        tracing::info!(
            requested = count,
            selected = devices.len(),
            kind = %self.config.device_kind,
            "Selected devices from inventory"
        );

        self.run_batch(
            &devices,
            request_factory,
            self.config.poll,
            self.config.minimum_reserve,
        )
        .await
    }

    /// Starts and verifies one update per device. Refusals that concern the
    /// batch as a whole are returned before any device is contacted;
    /// everything else is reported per device.
    pub async fn run_batch<F>(
        &self,
        devices: &[DeviceId],
        request_factory: F,
        policy: PollPolicy,
        minimum_reserve: usize,
    ) -> Result<BatchReport, BatchError>
    where
        F: Fn(&DeviceId) -> UpdateRequest,
    {
        let started_at = Utc::now();

        if devices.is_empty() {
            return Err(BatchError::EmptyBatch);
        }
        let mut unique = HashSet::new();
        for device_id in devices {
            if !unique.insert(device_id) {
                return Err(BatchError::DuplicateDevice(device_id.clone()));
            }
        }
        policy.validate().map_err(BatchError::InvalidParameters)?;
        if minimum_reserve == 0 {
            return Err(BatchError::InvalidParameters(
                "minimum_reserve must be at least 1".to_string(),
            ));
        }

        let available: HashSet<DeviceId> = self
            .inventory
            .available_devices(self.config.device_kind)
            .await
            .map_err(BatchError::Inventory)?
            .into_iter()
            .collect();
        let selected = devices
            .iter()
            .filter(|device_id| available.contains(*device_id))
            .count();
        if available.len() - selected < minimum_reserve {
            return Err(BatchError::ReserveViolation {
                selected,
                available: available.len(),
                minimum_reserve,
            });
        }

        let mut outcomes = BTreeMap::new();
        let mut task_set = JoinSet::new();
        let mut task_devices = HashMap::new();
        let pipeline = Pipeline {
            operations: self.operations.clone(),
            scheduler: self.scheduler.clone(),
            catalog: self.config.stages.clone(),
            policy,
            strict_deadline: self.config.strict_deadline,
            start_limiter: Arc::new(Semaphore::new(self.config.max_concurrency)),
        };

        for device_id in devices {
            if !available.contains(device_id) {
                let reason = RejectReason::DeviceUnavailable(format!(
                    "{device_id} is not listed by the inventory"
                ));
                tracing::warn!(%device_id, %reason, "Skipping device");
                outcomes.insert(device_id.clone(), DeviceOutcome::skipped(reason));
                continue;
            }

            let request = request_factory(device_id);
            let pipeline = pipeline.clone();
            let span = tracing::info_span!(
                "verify_update",
                device_id = %device_id,
                slot = %request.slot,
            );
            let task_device = device_id.clone();

            let abort_handle = task_set.spawn(
                async move {
                    let outcome = pipeline.run(request).await;
                    (task_device, outcome)
                }
                .instrument(span),
            );
            task_devices.insert(abort_handle.id(), device_id.clone());
        }

        // Drain the whole set so no pipeline outlives the report.
        while let Some(result) = task_set.join_next().await {
            match result {
                Ok((device_id, outcome)) => {
                    outcomes.insert(device_id, outcome);
                }
                Err(join_error) => {
                    // An unmatched task is picked up by `report_lost_pipelines`.
                    let Some(device_id) = task_devices.get(&join_error.id()).cloned() else {
                        tracing::error!(error = %join_error, "Untracked pipeline task failed");
                        continue;
                    };
                    tracing::error!(%device_id, error = %join_error, "Device pipeline panicked");
                    outcomes.insert(
                        device_id,
                        DeviceOutcome::failed(
                            FailureReason::Interrupted {
                                detail: format!("verification task failed: {join_error}"),
                            },
                            None,
                        ),
                    );
                }
            }
        }

        report_lost_pipelines(&mut outcomes, task_devices.into_values());

        if outcomes.values().all(|outcome| outcome.verdict.is_skipped()) {
            tracing::warn!("No update was accepted, nothing was polled");
        }

        let report = BatchReport::new(outcomes, started_at);
        let counts = report.counts();
        tracing::info!(
            result = report.result,
            passed = counts.passed,
            failed = counts.failed,
            timed_out = counts.timed_out,
            skipped = counts.skipped,
            "Batch finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::TokioClock;
    use crate::device::{MockInventory, OpenGate};
    use crate::error::TransportError;
    use crate::model::{DeviceKind, FirmwareStatus, ImageRef, Slot};
    use crate::test_util::{
        ScriptedController, StaticInventory, failed, idle, in_progress, succeeded,
    };

    fn inventory(devices: &[&str]) -> StaticInventory {
        StaticInventory(ids(devices))
    }

    fn coordinator(
        controller: Arc<ScriptedController>,
        inventory: impl Inventory + 'static,
        config: VerifierConfig,
    ) -> BatchCoordinator {
        BatchCoordinator::new(
            controller,
            Arc::new(OpenGate),
            Arc::new(inventory),
            Arc::new(TokioClock),
            config,
        )
    }

    fn primary(device_id: &DeviceId) -> UpdateRequest {
        UpdateRequest::new(
            device_id.clone(),
            DeviceKind::PowerSupply,
            Slot::Primary,
            ImageRef::new("/fw/psu/primary.hex"),
        )
    }

    fn ids(devices: &[&str]) -> Vec<DeviceId> {
        devices.iter().map(|id| DeviceId::new(*id)).collect()
    }

    fn healthy() -> Vec<Result<FirmwareStatus, ControllerError>> {
        vec![
            Ok(idle("12.05.03")),
            Ok(in_progress("transfer", "12.05.03")),
            Ok(succeeded("12.06.03")),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_device_does_not_affect_sibling() {
        let controller = Arc::new(
            ScriptedController::new()
                .statuses("psu-a", healthy())
                .statuses("psu-b", vec![Ok(in_progress("transfer", "12.05.03"))]),
        );
        let coordinator = coordinator(
            controller.clone(),
            inventory(&["psu-a", "psu-b", "psu-c"]),
            VerifierConfig::default(),
        );

        let report = coordinator
            .run_batch(&ids(&["psu-a", "psu-b"]), primary, PollPolicy::default(), 1)
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[&DeviceId::new("psu-a")].verdict, Verdict::Passed);
        assert_eq!(
            report.outcomes[&DeviceId::new("psu-b")].verdict,
            Verdict::Skipped(RejectReason::DeviceBusy)
        );
        assert!(report.result);
        assert_eq!(controller.start_count("psu-b"), 0);

        let record = report.outcomes[&DeviceId::new("psu-a")].record.as_ref().unwrap();
        assert_eq!(record.samples.len(), 2);
        assert_eq!(record.revision_after.as_deref(), Some("12.06.03"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_violation_is_refused_before_any_start() {
        let controller = Arc::new(ScriptedController::new());
        let coordinator = coordinator(
            controller.clone(),
            inventory(&["psu-1", "psu-2", "psu-3"]),
            VerifierConfig::default(),
        );

        let err = coordinator
            .run_batch(
                &ids(&["psu-1", "psu-2"]),
                primary,
                PollPolicy::default(),
                2,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BatchError::ReserveViolation {
                selected: 2,
                available: 3,
                minimum_reserve: 2
            }
        ));
        assert_eq!(controller.start_count("psu-1"), 0);
        assert_eq!(controller.start_count("psu-2"), 0);
        assert!(controller.query_times("psu-1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_up_front_refusals() {
        let coordinator = coordinator(
            Arc::new(ScriptedController::new()),
            inventory(&["psu-1", "psu-2"]),
            VerifierConfig::default(),
        );

        assert!(matches!(
            coordinator
                .run_batch(&[], primary, PollPolicy::default(), 1)
                .await,
            Err(BatchError::EmptyBatch)
        ));
        assert!(matches!(
            coordinator
                .run_batch(&ids(&["psu-1", "psu-1"]), primary, PollPolicy::default(), 1)
                .await,
            Err(BatchError::DuplicateDevice(_))
        ));
        assert!(matches!(
            coordinator
                .run_batch(&ids(&["psu-1"]), primary, PollPolicy::default(), 0)
                .await,
            Err(BatchError::InvalidParameters(_))
        ));
        let policy = PollPolicy {
            budget: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            coordinator
                .run_batch(&ids(&["psu-1"]), primary, policy, 1)
                .await,
            Err(BatchError::InvalidParameters(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inventory_failure_is_a_batch_error() {
        let mut inventory = MockInventory::new();
        inventory
            .expect_available_devices()
            .returning(|_| Err(TransportError::Unreachable("inventory offline".to_string())));
        let coordinator = coordinator(
            Arc::new(ScriptedController::new()),
            inventory,
            VerifierConfig::default(),
        );

        let err = coordinator
            .run_batch(&ids(&["psu-1"]), primary, PollPolicy::default(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Inventory(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_rejected_short_circuits_polling() {
        let controller = Arc::new(
            ScriptedController::new()
                .statuses("psu-1", vec![Ok(in_progress("transfer", "12.05.03"))])
                .statuses("psu-2", vec![Ok(in_progress("verification", "12.05.03"))]),
        );
        let coordinator = coordinator(
            controller.clone(),
            inventory(&["psu-1", "psu-2", "psu-3", "psu-4"]),
            VerifierConfig::default(),
        );
        let started = tokio::time::Instant::now();

        let report = coordinator
            .run_batch(
                &ids(&["psu-1", "psu-2", "psu-9"]),
                primary,
                PollPolicy::default(),
                1,
            )
            .await
            .unwrap();

        assert!(report.outcomes.values().all(|o| o.verdict.is_skipped()));
        assert!(report.result);
        assert_eq!(controller.query_times("psu-1").len(), 1);
        assert_eq!(controller.query_times("psu-2").len(), 1);
        assert!(controller.query_times("psu-9").is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(
            report.outcomes[&DeviceId::new("psu-9")].verdict,
            Verdict::Skipped(RejectReason::DeviceUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verdict_mapping() {
        let controller = Arc::new(
            ScriptedController::new()
                .statuses(
                    "psu-failed",
                    vec![Ok(idle("12.05.03")), Ok(failed("transfer", "12.05.03"))],
                )
                .statuses(
                    "psu-regressed",
                    vec![
                        Ok(idle("12.05.03")),
                        Ok(in_progress("verification", "12.05.03")),
                        Ok(in_progress("transfer", "12.05.03")),
                        Ok(succeeded("12.06.03")),
                    ],
                )
                .statuses(
                    "psu-corrupt",
                    vec![Ok(idle("12.05.03")), Ok(succeeded("13.06.03"))],
                )
                .statuses(
                    "psu-stuck",
                    vec![Ok(idle("12.05.03")), Ok(in_progress("transfer", "12.05.03"))],
                )
                .statuses(
                    "psu-offline",
                    vec![
                        Ok(idle("12.05.03")),
                        Err(TransportError::Unreachable("bmc reset".to_string()).into()),
                    ],
                )
                .statuses(
                    "psu-revoked",
                    vec![
                        Ok(idle("12.05.03")),
                        Err(ControllerError::AuthorizationDenied("token revoked".to_string())),
                    ],
                ),
        );
        let devices = [
            "psu-failed",
            "psu-regressed",
            "psu-corrupt",
            "psu-stuck",
            "psu-offline",
            "psu-revoked",
        ];
        let mut all = devices.to_vec();
        all.push("psu-spare");
        let coordinator = coordinator(controller, inventory(&all), VerifierConfig::default());

        let report = coordinator
            .run_batch(&ids(&devices), primary, PollPolicy::default(), 1)
            .await
            .unwrap();

        assert!(!report.result);
        assert_eq!(
            report.outcomes[&DeviceId::new("psu-failed")].verdict,
            Verdict::Failed(FailureReason::UpdateFailed {
                stage: "transfer".to_string()
            })
        );
        assert!(
            report.outcomes[&DeviceId::new("psu-failed")]
                .diagnostic
                .contains("transfer")
        );

        let regressed = &report.outcomes[&DeviceId::new("psu-regressed")];
        assert!(matches!(
            regressed.verdict,
            Verdict::Failed(FailureReason::Stage {
                violation: StageViolation::StageRegression { .. }
            })
        ));
        // Polling stopped at the regression, the success was never fetched.
        assert_eq!(regressed.record.as_ref().unwrap().samples.len(), 2);

        assert!(matches!(
            report.outcomes[&DeviceId::new("psu-corrupt")].verdict,
            Verdict::Failed(FailureReason::RevisionInvariant { .. })
        ));
        assert_eq!(report.outcomes[&DeviceId::new("psu-stuck")].verdict, Verdict::TimedOut);
        assert!(
            report.outcomes[&DeviceId::new("psu-offline")]
                .verdict
                .is_infrastructure_failure()
        );
        assert!(matches!(
            report.outcomes[&DeviceId::new("psu-revoked")].verdict,
            Verdict::Failed(FailureReason::Interrupted { .. })
        ));
        assert_eq!(
            report.infrastructure_failures(),
            vec![&DeviceId::new("psu-offline"), &DeviceId::new("psu-revoked")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_deadline_fails_pending_updates() {
        let controller = Arc::new(ScriptedController::new().statuses(
            "psu-1",
            vec![Ok(idle("12.05.03")), Ok(in_progress("transfer", "12.05.03"))],
        ));
        let config = VerifierConfig {
            strict_deadline: true,
            ..Default::default()
        };
        let coordinator = coordinator(controller, inventory(&["psu-1", "psu-2"]), config);

        let report = coordinator
            .run_batch(&ids(&["psu-1"]), primary, PollPolicy::default(), 1)
            .await
            .unwrap();

        assert_eq!(
            report.outcomes[&DeviceId::new("psu-1")].verdict,
            Verdict::Failed(FailureReason::DeadlineExceeded {
                state: UpdateState::InProgress,
                stage: "transfer".to_string(),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_pipeline_is_isolated() {
        let controller = Arc::new(
            ScriptedController::new()
                .statuses("psu-a", healthy())
                .statuses("psu-b", vec![Ok(idle("12.05.03"))])
                .panic_on_status("psu-b"),
        );
        let coordinator = coordinator(
            controller,
            inventory(&["psu-a", "psu-b", "psu-c"]),
            VerifierConfig::default(),
        );

        let report = coordinator
            .run_batch(&ids(&["psu-a", "psu-b"]), primary, PollPolicy::default(), 1)
            .await
            .unwrap();

        assert_eq!(report.outcomes[&DeviceId::new("psu-a")].verdict, Verdict::Passed);
        assert!(matches!(
            report.outcomes[&DeviceId::new("psu-b")].verdict,
            Verdict::Failed(FailureReason::Interrupted { .. })
        ));
        assert!(!report.result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_and_run_keeps_reserve() {
        let controller = Arc::new(
            ScriptedController::new()
                .statuses("psu-1", healthy())
                .statuses("psu-2", healthy()),
        );
        let coordinator = coordinator(
            controller.clone(),
            inventory(&["psu-1", "psu-2", "psu-3"]),
            VerifierConfig::default(),
        );

        let report = coordinator.select_and_run(5, primary).await.unwrap();

        assert_eq!(
            report.outcomes.keys().cloned().collect::<Vec<_>>(),
            ids(&["psu-1", "psu-2"])
        );
        assert!(report.result);
        assert_eq!(controller.start_count("psu-3"), 0);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcomes"]["psu-1"]["verdict"]["verdict"], "passed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_device_does_not_hold_back_queued_devices() {
        let controller = Arc::new(
            ScriptedController::new()
                .statuses(
                    "psu-stuck",
                    vec![Ok(idle("12.05.03")), Ok(in_progress("transfer", "12.05.03"))],
                )
                .statuses("psu-ok", healthy()),
        );
        let config = VerifierConfig {
            max_concurrency: 1,
            ..Default::default()
        };
        let coordinator = coordinator(
            controller.clone(),
            inventory(&["psu-stuck", "psu-ok", "psu-spare"]),
            config,
        );
        let started = tokio::time::Instant::now();

        let report = coordinator
            .run_batch(
                &ids(&["psu-stuck", "psu-ok"]),
                primary,
                PollPolicy::default(),
                1,
            )
            .await
            .unwrap();

        assert_eq!(report.outcomes[&DeviceId::new("psu-stuck")].verdict, Verdict::TimedOut);
        assert_eq!(report.outcomes[&DeviceId::new("psu-ok")].verdict, Verdict::Passed);
        let offsets: Vec<Duration> = controller
            .query_times("psu-ok")
            .iter()
            .map(|at| at.duration_since(started))
            .collect();
        assert_eq!(
            offsets,
            vec![
                Duration::ZERO,
                Duration::from_secs(5 * 60),
                Duration::from_secs(12 * 60)
            ]
        );
        assert!(started.elapsed() <= Duration::from_secs(12 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_update_that_never_starts_fails_at_first_check() {
        let controller = Arc::new(
            ScriptedController::new().statuses("psu-1", vec![Ok(idle("12.05.03"))]),
        );
        let coordinator = coordinator(
            controller.clone(),
            inventory(&["psu-1", "psu-2"]),
            VerifierConfig::default(),
        );

        let report = coordinator
            .run_batch(&ids(&["psu-1"]), primary, PollPolicy::default(), 1)
            .await
            .unwrap();

        let outcome = &report.outcomes[&DeviceId::new("psu-1")];
        assert_eq!(
            outcome.verdict,
            Verdict::Failed(FailureReason::Stage {
                violation: StageViolation::NeverStarted { sequence: 0 }
            })
        );
        assert_eq!(outcome.record.as_ref().unwrap().samples.len(), 1);
        // Pre-check plus the 5 minute sample, nothing after.
        assert_eq!(controller.query_times("psu-1").len(), 2);
        assert!(!report.result);
    }

    #[test]
    fn test_lost_pipelines_are_reported() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert(
            DeviceId::new("psu-1"),
            DeviceOutcome::skipped(RejectReason::DeviceBusy),
        );

        report_lost_pipelines(&mut outcomes, ids(&["psu-1", "psu-2"]));

        assert_eq!(outcomes.len(), 2);
        assert_eq!(
            outcomes[&DeviceId::new("psu-1")].verdict,
            Verdict::Skipped(RejectReason::DeviceBusy)
        );
        assert!(matches!(
            outcomes[&DeviceId::new("psu-2")].verdict,
            Verdict::Failed(FailureReason::Interrupted { .. })
        ));
    }
}
