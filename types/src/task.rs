// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Planned units of work and their runtime task records

use crate::service::ProvisionerAction;
use chrono::DateTime;
use chrono::Utc;
use parse_display::Display;
use provisioner_common::typed_uuid::ClusterUuid;
use provisioner_common::typed_uuid::JobUuid;
use provisioner_common::typed_uuid::NodeUuid;
use provisioner_common::typed_uuid::TaskUuid;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Identifies a planned unit of work: one action on one service (or on the
/// node itself) on one node
#[derive(
    Clone, Debug, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
pub struct TaskUnit {
    pub node_id: NodeUuid,
    /// `None` for node-level actions
    pub service: Option<String>,
    pub action: ProvisionerAction,
}

impl TaskUnit {
    pub fn service(
        node_id: NodeUuid,
        service: &str,
        action: ProvisionerAction,
    ) -> TaskUnit {
        TaskUnit { node_id, service: Some(service.to_string()), action }
    }

    pub fn node(node_id: NodeUuid, action: ProvisionerAction) -> TaskUnit {
        TaskUnit { node_id, service: None, action }
    }
}

impl fmt::Display for TaskUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.service {
            Some(service) => {
                write!(f, "{} {} on {}", self.action, service, self.node_id)
            }
            None => write!(f, "{} node {}", self.action, self.node_id),
        }
    }
}

/// Identifies a worker holding leases
#[derive(
    Clone, Debug, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        WorkerId(s.to_string())
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, PartialEq, Eq, Hash, Serialize,
)]
#[display(style = "SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// waiting on predecessors
    Created,
    /// eligible and waiting for a worker
    Queued,
    /// leased by a worker
    InProgress,
    Complete,
    Failed,
    /// abandoned without being executed
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

/// A worker's time-bounded claim on a task
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct TaskLease {
    pub worker_id: WorkerId,
    /// distinguishes successive leases of the same task
    pub generation: u64,
    pub expires_at: DateTime<Utc>,
}

/// The runtime, stateful instance of a [`TaskUnit`]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: TaskUuid,
    pub job_id: JobUuid,
    pub cluster_id: ClusterUuid,
    pub unit: TaskUnit,
    pub predecessors: BTreeSet<TaskUuid>,
    pub status: TaskStatus,
    pub lease: Option<TaskLease>,
    /// number of failed attempts so far
    pub attempts: u32,
    pub time_submitted: Option<DateTime<Utc>>,
    pub time_completed: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Task {
    pub fn new(
        job_id: JobUuid,
        cluster_id: ClusterUuid,
        unit: TaskUnit,
        predecessors: BTreeSet<TaskUuid>,
    ) -> Task {
        Task {
            id: TaskUuid::new_v4(),
            job_id,
            cluster_id,
            unit,
            predecessors,
            status: TaskStatus::Created,
            lease: None,
            attempts: 0,
            time_submitted: None,
            time_completed: None,
            last_error: None,
        }
    }
}
