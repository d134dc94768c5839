// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What to do when a task fails
//!
//! A failed task is retried until it has failed `max_attempts` times.  After
//! that the job fails: no new tasks are started, work already in flight is
//! allowed to finish, and everything that never started is skipped.  Nothing
//! already done is undone; the cluster's state machine records the failure
//! and a later job can correct it.

use provisioner_common::typed_uuid::TaskUuid;
use provisioner_types::task::Task;
use provisioner_types::task::TaskStatus;
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// enqueue the task again
    Retry,
    /// give up on the task and the job
    Fail,
}

impl RetryPolicy {
    /// Records a failed attempt of `task` and decides what happens next
    pub fn on_failure(&self, task: &mut Task, details: String) -> RetryDecision {
        task.attempts += 1;
        task.last_error = Some(details);
        task.lease = None;
        if task.attempts < self.max_attempts {
            task.status = TaskStatus::Queued;
            RetryDecision::Retry
        } else {
            task.status = TaskStatus::Failed;
            RetryDecision::Fail
        }
    }
}

/// Skips every task that was never submitted plus those in `withdrawn`
/// (taken back out of the queue before a worker leased them), returning the
/// ids of the skipped tasks
///
/// Tasks held by a worker are left alone so that their outcomes are still
/// recorded.
pub fn abort_plan<'a>(
    tasks: impl IntoIterator<Item = &'a mut Task>,
    withdrawn: &BTreeSet<TaskUuid>,
) -> Vec<TaskUuid> {
    let mut skipped = Vec::new();
    for task in tasks {
        if task.status.is_terminal() {
            continue;
        }
        if task.status == TaskStatus::Created || withdrawn.contains(&task.id) {
            task.status = TaskStatus::Skipped;
            task.lease = None;
            skipped.push(task.id);
        }
    }
    skipped
}
