// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runtime status of background tasks

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;

/// What kind of event triggered an activation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationReason {
    Signaled,
    Timeout,
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskStatus {
    pub current: CurrentStatus,
    /// the last completed activation
    pub last: LastResult,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "current_status", content = "details", rename_all = "snake_case")]
pub enum CurrentStatus {
    /// waiting for the next activation
    Idle,
    Running { start_time: DateTime<Utc>, reason: ActivationReason, iteration: u64 },
}

impl CurrentStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, CurrentStatus::Idle)
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "last_result", content = "details", rename_all = "snake_case")]
pub enum LastResult {
    NeverCompleted,
    Completed(LastResultCompleted),
}

impl LastResult {
    pub fn has_completed(&self) -> bool {
        matches!(self, LastResult::Completed(_))
    }

    pub fn completion(&self) -> Option<&LastResultCompleted> {
        match self {
            LastResult::Completed(completed) => Some(completed),
            LastResult::NeverCompleted => None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LastResultCompleted {
    /// which iteration this was (counter)
    pub iteration: u64,
    /// wall-clock time when the activation started
    pub start_time: DateTime<Utc>,
    pub reason: ActivationReason,
    pub elapsed: Duration,
    /// summary emitted by the background task
    pub details: serde_json::Value,
}
