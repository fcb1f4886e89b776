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

use crate::model::Slot;

pub const REVISION_SEPARATOR: char = '.';
pub const REVISION_SEGMENTS: usize = 3;

/// Devices report this marker when they have no known revision.
pub const UNKNOWN_REVISION_MARKER: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionCheck {
    Passed,
    Violated(String),
}

impl RevisionCheck {
    pub fn is_passed(&self) -> bool {
        matches!(self, RevisionCheck::Passed)
    }
}

/// Checks that updating `slot` changed only the revision segment that slot
/// owns. A revision string is `A.B.C`: a primary update may only change `B`,
/// a secondary update may only change `C`.
pub struct RevisionInvariantChecker;

impl RevisionInvariantChecker {
    pub fn check(revision_before: &str, revision_after: &str, slot: Slot) -> RevisionCheck {
        if is_unknown(revision_before) {
            return RevisionCheck::Passed;
        }

        let (Some(before), Some(after)) = (segments(revision_before), segments(revision_after))
        else {
            return RevisionCheck::Violated(format!(
                "expected {REVISION_SEGMENTS} '{REVISION_SEPARATOR}'-separated segments, before: {revision_before:?}, after: {revision_after:?}"
            ));
        };

        let changed: Vec<usize> = slot
            .protected_segments()
            .iter()
            .copied()
            .filter(|&idx| before[idx] != after[idx])
            .collect();

        if changed.is_empty() {
            RevisionCheck::Passed
        } else {
            RevisionCheck::Violated(format!(
                "{slot} update changed protected segment(s) {changed:?}: before {revision_before:?}, after {revision_after:?}"
            ))
        }
    }
}

fn is_unknown(revision: &str) -> bool {
    revision
        .to_ascii_lowercase()
        .contains(UNKNOWN_REVISION_MARKER)
}

fn segments(revision: &str) -> Option<Vec<&str>> {
    let parts: Vec<&str> = revision.split(REVISION_SEPARATOR).collect();
    (parts.len() == REVISION_SEGMENTS).then_some(parts)
}
