// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clusters, their nodes, and the cluster lifecycle state machine

use crate::job::OperationKind;
use chrono::DateTime;
use chrono::Utc;
use parse_display::Display;
use provisioner_common::typed_uuid::ClusterUuid;
use provisioner_common::typed_uuid::JobUuid;
use provisioner_common::typed_uuid::NodeUuid;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// A cluster as tracked by the orchestrator
///
/// Mutated only through state-machine transitions driven by the outcome of
/// the cluster's jobs.  `active_job` mirrors the per-cluster advisory lock so
/// that ownership survives a restart.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub id: ClusterUuid,
    pub name: String,
    pub owner: String,
    pub template: String,
    /// number of nodes the cluster should have once its latest job finishes
    pub node_count: usize,
    pub nodes: BTreeSet<NodeUuid>,
    pub services: BTreeSet<String>,
    pub hardware_type: String,
    pub image_type: String,
    pub status: ClusterStatus,
    pub active_job: Option<JobUuid>,
    pub latest_job: Option<JobUuid>,
    pub time_created: DateTime<Utc>,
    pub time_expires: Option<DateTime<Utc>>,
}

/// Lifecycle of a cluster
///
/// ```text
/// PENDING -> ACTIVE -> { ACTIVE, INCOMPLETE, FAILED } -> TERMINATED
/// ```
///
/// A new job moves any cluster that isn't terminated back to ACTIVE.
/// Nothing leaves TERMINATED.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, PartialEq, Eq, Serialize,
)]
#[display(style = "SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    /// the layout is being solved and the first job hasn't started
    Pending,
    /// a job is executing with no failures, or the last job succeeded
    Active,
    /// the last job failed but the cluster remains usable
    Incomplete,
    /// the cluster could not be brought up (or torn down)
    Failed,
    /// the cluster was deleted
    Terminated,
}

/// Job outcomes that drive the cluster state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterEvent {
    JobStarted,
    JobSucceeded { operation: OperationKind },
    JobFailed { operation: OperationKind },
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("cluster in state {from} cannot handle {event:?}")]
pub struct InvalidTransition {
    pub from: ClusterStatus,
    pub event: ClusterEvent,
}

impl ClusterStatus {
    pub fn is_terminated(&self) -> bool {
        matches!(self, ClusterStatus::Terminated)
    }

    /// Computes the state that follows `self` on `event`
    pub fn transition(
        self,
        event: ClusterEvent,
    ) -> Result<ClusterStatus, InvalidTransition> {
        let invalid = || InvalidTransition { from: self, event };
        match (self, event) {
            (ClusterStatus::Terminated, _) => Err(invalid()),
            (_, ClusterEvent::JobStarted) => Ok(ClusterStatus::Active),
            (ClusterStatus::Active, ClusterEvent::JobSucceeded { operation }) => {
                if operation == OperationKind::Delete {
                    Ok(ClusterStatus::Terminated)
                } else {
                    Ok(ClusterStatus::Active)
                }
            }
            (ClusterStatus::Active, ClusterEvent::JobFailed { operation }) => {
                match operation {
                    OperationKind::Create | OperationKind::Delete => {
                        Ok(ClusterStatus::Failed)
                    }
                    _ => Ok(ClusterStatus::Incomplete),
                }
            }
            (
                ClusterStatus::Pending
                | ClusterStatus::Incomplete
                | ClusterStatus::Failed,
                ClusterEvent::JobSucceeded { .. }
                | ClusterEvent::JobFailed { .. },
            ) => Err(invalid()),
        }
    }
}

/// A machine belonging to a cluster
///
/// `services` holds what is actually installed: it grows when an install
/// task completes and shrinks when a remove task completes.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Node {
    pub id: NodeUuid,
    pub cluster_id: ClusterUuid,
    /// position of the node within its cluster; used for stable ordering
    pub ordinal: u32,
    pub hardware_type: String,
    pub image_type: String,
    pub services: BTreeSet<String>,
    pub properties: NodeProperties,
}

/// Facts about a node, mostly reported by the agent that created it
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct NodeProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, rename = "ipaddresses")]
    pub ip_addresses: BTreeMap<String, String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, String>,
}

impl NodeProperties {
    /// Folds properties reported by an agent into `self`
    pub fn merge(&mut self, update: NodeProperties) {
        if update.hostname.is_some() {
            self.hostname = update.hostname;
        }
        self.ip_addresses.extend(update.ip_addresses);
        self.extra.extend(update.extra);
    }

    /// Renders the properties as a JSON object, keeping only the named
    /// properties (or all of them if `names` is empty)
    pub fn to_json_filtered(
        &self,
        names: &BTreeSet<String>,
    ) -> serde_json::Map<String, serde_json::Value> {
        let serde_json::Value::Object(all) =
            serde_json::to_value(self).unwrap_or_default()
        else {
            return serde_json::Map::new();
        };
        if names.is_empty() {
            return all;
        }
        all.into_iter().filter(|(k, _)| names.contains(k)).collect()
    }
}
