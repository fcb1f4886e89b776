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

use serde::{Deserialize, Serialize};

use crate::model::{PollResult, UpdateState};

/// Ordered stage labels a device walks through while reflashing. The last
/// label is the completion stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageCatalog {
    stages: Vec<String>,
}

impl Default for StageCatalog {
    fn default() -> Self {
        Self::new(["negotiation", "transfer", "verification", "completion"])
    }
}

impl StageCatalog {
    pub fn new<I, S>(stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stages: stages.into_iter().map(Into::into).collect(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.stages.is_empty() {
            return Err("stage catalog must not be empty".to_string());
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            let key = normalize(stage);
            if key.is_empty() {
                return Err("stage labels must not be empty".to_string());
            }
            if !seen.insert(key) {
                return Err(format!("stage {stage:?} is listed more than once"));
            }
        }
        Ok(())
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn completion(&self) -> &str {
        self.stages.last().map(String::as_str).unwrap_or_default()
    }

    /// Position of `label` in the catalog.
    pub fn ordinal(&self, label: &str) -> Option<usize> {
        let key = normalize(label);
        self.stages.iter().position(|stage| normalize(stage) == key)
    }

    /// An empty label means the device has not entered any stage yet.
    pub fn is_unset(label: &str) -> bool {
        label.trim().is_empty()
    }

    pub fn is_completion(&self, label: &str) -> bool {
        !self.stages.is_empty() && normalize(label) == normalize(self.completion())
    }
}

fn normalize(label: &str) -> String {
    label.trim().to_ascii_lowercase()
}

/// Fatal inconsistencies in a device's sample sequence.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum StageViolation {
    #[error("stage regressed from {from:?} to {to:?} at sample {sequence}")]
    StageRegression {
        from: String,
        to: String,
        sequence: u32,
    },

    #[error("status regressed from {from} to {to} at sample {sequence}")]
    StateRegression {
        from: UpdateState,
        to: UpdateState,
        sequence: u32,
    },

    #[error("reported success at non-terminal stage {stage:?} (sample {sequence})")]
    PrematureSuccess { stage: String, sequence: u32 },

    #[error("update was accepted but never started (sample {sequence})")]
    NeverStarted { sequence: u32 },

    #[error("reported failure without a stage (sample {sequence})")]
    FailedWithoutStage { sequence: u32 },

    #[error("reported unknown stage {stage:?} at sample {sequence}")]
    UnknownStage { stage: String, sequence: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageVerdict {
    Succeeded { stage: String },
    /// The stage is where the device gave up, e.g. negotiation vs transfer.
    Failed { stage: String },
    /// No terminal sample was observed.
    Pending {
        state: UpdateState,
        stage: Option<String>,
    },
    Violation(StageViolation),
}

/// Incremental `InProgress -> {Succeeded, Failed}` state machine over the
/// samples of an accepted update. A device still reporting `NotStarted` never
/// picked the update up.
#[derive(Debug)]
pub struct StageMachine<'a> {
    catalog: &'a StageCatalog,
    state: UpdateState,
    stage: Option<(usize, String)>,
    violation: Option<StageViolation>,
}

impl<'a> StageMachine<'a> {
    pub fn new(catalog: &'a StageCatalog) -> Self {
        Self {
            catalog,
            state: UpdateState::NotStarted,
            stage: None,
            violation: None,
        }
    }

    /// Feeds one sample. Unacknowledged samples carry no state and are
    /// skipped. Once a violation is reported the machine stays violated.
    pub fn observe(&mut self, sample: &PollResult) -> Result<UpdateState, StageViolation> {
        if let Some(violation) = &self.violation {
            return Err(violation.clone());
        }
        if !sample.acknowledged {
            return Ok(self.state);
        }

        match self.transition(sample) {
            Ok(state) => Ok(state),
            Err(violation) => {
                self.violation = Some(violation.clone());
                Err(violation)
            }
        }
    }

    fn transition(&mut self, sample: &PollResult) -> Result<UpdateState, StageViolation> {
        let sequence = sample.sequence;
        let ordinal = if StageCatalog::is_unset(&sample.stage) {
            None
        } else {
            let ordinal = self.catalog.ordinal(&sample.stage).ok_or_else(|| {
                StageViolation::UnknownStage {
                    stage: sample.stage.clone(),
                    sequence,
                }
            })?;
            Some(ordinal)
        };

        let previous_ordinal = self.stage.as_ref().map(|(ordinal, _)| *ordinal);
        if ordinal < previous_ordinal {
            return Err(StageViolation::StageRegression {
                from: self
                    .stage
                    .as_ref()
                    .map(|(_, label)| label.clone())
                    .unwrap_or_default(),
                to: sample.stage.clone(),
                sequence,
            });
        }

        let state_went_back = sample.state.rank() < self.state.rank();
        let terminal_changed = self.state.is_terminal() && sample.state != self.state;
        if state_went_back || terminal_changed {
            return Err(StageViolation::StateRegression {
                from: self.state,
                to: sample.state,
                sequence,
            });
        }

        match sample.state {
            UpdateState::Succeeded if !self.catalog.is_completion(&sample.stage) => {
                return Err(StageViolation::PrematureSuccess {
                    stage: sample.stage.clone(),
                    sequence,
                });
            }
            UpdateState::Failed if ordinal.is_none() => {
                return Err(StageViolation::FailedWithoutStage { sequence });
            }
            UpdateState::NotStarted => {
                return Err(StageViolation::NeverStarted { sequence });
            }
            _ => {}
        }

        if let Some(ordinal) = ordinal {
            self.stage = Some((ordinal, sample.stage.clone()));
        }
        self.state = sample.state;
        Ok(self.state)
    }

    pub fn verdict(&self) -> StageVerdict {
        if let Some(violation) = &self.violation {
            return StageVerdict::Violation(violation.clone());
        }
        let stage = self.stage.as_ref().map(|(_, label)| label.clone());
        match self.state {
            UpdateState::Succeeded => StageVerdict::Succeeded {
                stage: stage.unwrap_or_default(),
            },
            UpdateState::Failed => StageVerdict::Failed {
                stage: stage.unwrap_or_default(),
            },
            state => StageVerdict::Pending { state, stage },
        }
    }
}

/// Classifies a complete sample sequence.
pub struct StageVerifier<'a> {
    catalog: &'a StageCatalog,
}

impl<'a> StageVerifier<'a> {
    pub fn new(catalog: &'a StageCatalog) -> Self {
        Self { catalog }
    }

    pub fn verify(&self, samples: &[PollResult]) -> StageVerdict {
        let mut machine = StageMachine::new(self.catalog);
        for sample in samples {
            if machine.observe(sample).is_err() {
                break;
            }
        }
        machine.verdict()
    }
}
