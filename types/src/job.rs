// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster jobs: one requested operation and the tasks that carry it out

use crate::task::Task;
use crate::task::TaskStatus;
use crate::task::TaskUnit;
use chrono::DateTime;
use chrono::Utc;
use parse_display::Display;
use provisioner_common::typed_uuid::ClusterUuid;
use provisioner_common::typed_uuid::JobUuid;
use provisioner_common::typed_uuid::TaskUuid;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;

/// An operation requested on a cluster, with its arguments
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterOperation {
    Create,
    Resize { node_count: usize },
    AddServices { services: BTreeSet<String> },
    RemoveServices { services: BTreeSet<String> },
    Start,
    Stop,
    Restart,
    Delete,
}

impl ClusterOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            ClusterOperation::Create => OperationKind::Create,
            ClusterOperation::Resize { .. } => OperationKind::Resize,
            ClusterOperation::AddServices { .. } => OperationKind::AddServices,
            ClusterOperation::RemoveServices { .. } => {
                OperationKind::RemoveServices
            }
            ClusterOperation::Start => OperationKind::Start,
            ClusterOperation::Stop => OperationKind::Stop,
            ClusterOperation::Restart => OperationKind::Restart,
            ClusterOperation::Delete => OperationKind::Delete,
        }
    }
}

/// The kind of a [`ClusterOperation`], without its arguments
#[derive(
    Clone, Copy, Debug, Deserialize, Display, PartialEq, Eq, Hash, Serialize,
)]
#[display(style = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Resize,
    AddServices,
    RemoveServices,
    Start,
    Stop,
    Restart,
    Delete,
}

impl OperationKind {
    pub const ALL: &'static [OperationKind] = &[
        OperationKind::Create,
        OperationKind::Resize,
        OperationKind::AddServices,
        OperationKind::RemoveServices,
        OperationKind::Start,
        OperationKind::Stop,
        OperationKind::Restart,
        OperationKind::Delete,
    ];
}

/// Aggregate status of a job
///
/// Moves only forward: `Active` to exactly one of the other states.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, PartialEq, Eq, Hash, Serialize,
)]
#[display(style = "SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Active,
    Complete,
    Failed,
    /// superseded by a delete before it finished
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Active)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("job {job_id} is already {status} and cannot become {requested}")]
pub struct JobAlreadyFinished {
    pub job_id: JobUuid,
    pub status: JobStatus,
    pub requested: JobStatus,
}

/// One requested operation on one cluster
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ClusterJob {
    pub id: JobUuid,
    pub cluster_id: ClusterUuid,
    pub operation: ClusterOperation,
    status: JobStatus,
    /// task ids in the plan's topological order
    pub task_ids: Vec<TaskUuid>,
    /// services the cluster should run once the job succeeds
    pub target_services: BTreeSet<String>,
    /// nodes the cluster should have once the job succeeds
    pub target_node_count: usize,
    pub time_created: DateTime<Utc>,
    pub time_finished: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl ClusterJob {
    pub fn new(
        cluster_id: ClusterUuid,
        operation: ClusterOperation,
        target_services: BTreeSet<String>,
        target_node_count: usize,
        now: DateTime<Utc>,
    ) -> ClusterJob {
        ClusterJob {
            id: JobUuid::new_v4(),
            cluster_id,
            operation,
            status: JobStatus::Active,
            task_ids: Vec::new(),
            target_services,
            target_node_count,
            time_created: now,
            time_finished: None,
            message: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Moves the job to a terminal status
    ///
    /// Fails if the job already finished; the first terminal status wins.
    pub fn finish(
        &mut self,
        status: JobStatus,
        now: DateTime<Utc>,
        message: Option<String>,
    ) -> Result<(), JobAlreadyFinished> {
        if self.status.is_terminal() || !status.is_terminal() {
            return Err(JobAlreadyFinished {
                job_id: self.id,
                status: self.status,
                requested: status,
            });
        }
        self.status = status;
        self.time_finished = Some(now);
        self.message = message;
        Ok(())
    }
}

/// Outcome summary of a job, grouped by task status
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub succeeded: Vec<TaskUnit>,
    pub failed: Vec<FailedUnit>,
    pub skipped: Vec<TaskUnit>,
    /// units that have not reached a terminal status
    pub pending: Vec<TaskUnit>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct FailedUnit {
    pub unit: TaskUnit,
    pub attempts: u32,
    pub error: Option<String>,
}

impl JobReport {
    /// Summarizes `tasks`, preserving their order
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut report = JobReport::default();
        for task in tasks {
            match task.status {
                TaskStatus::Complete => report.succeeded.push(task.unit.clone()),
                TaskStatus::Failed => report.failed.push(FailedUnit {
                    unit: task.unit.clone(),
                    attempts: task.attempts,
                    error: task.last_error.clone(),
                }),
                TaskStatus::Skipped => report.skipped.push(task.unit.clone()),
                TaskStatus::Created
                | TaskStatus::Queued
                | TaskStatus::InProgress => {
                    report.pending.push(task.unit.clone())
                }
            }
        }
        report
    }
}
