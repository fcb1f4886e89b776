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

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::device::{DeviceController, Inventory, StartResponse};
use crate::error::{ControllerError, TransportError};
use crate::model::{DeviceId, DeviceKind, FirmwareStatus, ImageRef, Slot, UpdateState};

type StatusAnswer = Result<FirmwareStatus, ControllerError>;

#[derive(Default)]
struct Script {
    statuses: VecDeque<StatusAnswer>,
    start: Option<Result<StartResponse, ControllerError>>,
    start_delay: Duration,
    panic_on_status: bool,
    served: usize,
}

/// Replays a fixed sequence of status answers per device. The last answer
/// repeats once the script runs out.
#[derive(Default)]
pub(crate) struct ScriptedController {
    scripts: Mutex<HashMap<DeviceId, Script>>,
    starts: Mutex<Vec<DeviceId>>,
    queries: Mutex<Vec<(DeviceId, Instant)>>,
}

impl ScriptedController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(self, device: &str, statuses: Vec<StatusAnswer>) -> Self {
        self.script(device, |script| script.statuses = statuses.into());
        self
    }

    pub fn start_response(
        self,
        device: &str,
        response: Result<StartResponse, ControllerError>,
    ) -> Self {
        self.script(device, |script| script.start = Some(response));
        self
    }

    pub fn slow_start(self, device: &str, delay: Duration) -> Self {
        self.script(device, |script| script.start_delay = delay);
        self
    }

    pub fn panic_on_status(self, device: &str) -> Self {
        self.script(device, |script| script.panic_on_status = true);
        self
    }

    fn script(&self, device: &str, update: impl FnOnce(&mut Script)) {
        let mut scripts = self.scripts.lock().unwrap();
        update(scripts.entry(DeviceId::new(device)).or_default());
    }

    pub fn start_count(&self, device: &str) -> usize {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == device)
            .count()
    }

    pub fn query_times(&self, device: &str) -> Vec<Instant> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.as_str() == device)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl DeviceController for ScriptedController {
    async fn start_firmware_update(
        &self,
        device_id: &DeviceId,
        _image: &ImageRef,
        _slot: Slot,
    ) -> Result<StartResponse, ControllerError> {
        self.starts.lock().unwrap().push(device_id.clone());
        let (response, delay) = {
            let scripts = self.scripts.lock().unwrap();
            let script = scripts.get(device_id);
            (
                script
                    .and_then(|script| script.start.clone())
                    .unwrap_or(Ok(StartResponse::Accepted)),
                script.map(|script| script.start_delay).unwrap_or_default(),
            )
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        response
    }

    async fn get_firmware_status(
        &self,
        device_id: &DeviceId,
    ) -> Result<FirmwareStatus, ControllerError> {
        self.queries
            .lock()
            .unwrap()
            .push((device_id.clone(), Instant::now()));
        let answer = {
            let mut scripts = self.scripts.lock().unwrap();
            let Some(script) = scripts.get_mut(device_id) else {
                return Ok(idle("12.05.03"));
            };
            script.served += 1;
            // The first query is the start pre-check.
            if script.panic_on_status && script.served > 1 {
                None
            } else {
                Some(match script.statuses.len() {
                    0 => Ok(idle("12.05.03")),
                    1 => script.statuses[0].clone(),
                    _ => script
                        .statuses
                        .pop_front()
                        .unwrap_or_else(|| Ok(idle("12.05.03"))),
                })
            }
        };
        // Panic outside the lock so sibling devices keep working.
        answer.unwrap_or_else(|| panic!("scripted panic for {device_id}"))
    }
}

pub(crate) fn idle(revision: &str) -> FirmwareStatus {
    FirmwareStatus::new(UpdateState::NotStarted, "", revision)
}

pub(crate) fn in_progress(stage: &str, revision: &str) -> FirmwareStatus {
    FirmwareStatus::new(UpdateState::InProgress, stage, revision)
}

pub(crate) fn succeeded(revision: &str) -> FirmwareStatus {
    FirmwareStatus::new(UpdateState::Succeeded, "completion", revision)
}

pub(crate) fn failed(stage: &str, revision: &str) -> FirmwareStatus {
    FirmwareStatus::new(UpdateState::Failed, stage, revision)
}

/// Lists a fixed set of devices for every kind.
pub(crate) struct StaticInventory(pub Vec<DeviceId>);

#[async_trait]
impl Inventory for StaticInventory {
    async fn available_devices(&self, _kind: DeviceKind) -> Result<Vec<DeviceId>, TransportError> {
        Ok(self.0.clone())
    }
}
