// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Datastore that keeps everything in memory

use super::Datastore;
use async_trait::async_trait;
use provisioner_common::api::Error;
use provisioner_common::api::ListResultVec;
use provisioner_common::typed_uuid::ClusterUuid;
use provisioner_common::typed_uuid::JobUuid;
use provisioner_common::typed_uuid::NodeUuid;
use provisioner_common::typed_uuid::TaskUuid;
use provisioner_types::cluster::Cluster;
use provisioner_types::cluster::Node;
use provisioner_types::job::ClusterJob;
use provisioner_types::task::Task;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Records live only as long as the process.  Used by tests and by the
/// binary when no storage directory is configured.
#[derive(Default)]
pub struct MemoryDatastore {
    inner: Mutex<Records>,
}

#[derive(Default)]
struct Records {
    clusters: BTreeMap<ClusterUuid, Cluster>,
    nodes: BTreeMap<NodeUuid, Node>,
    jobs: BTreeMap<JobUuid, ClusterJob>,
    tasks: BTreeMap<TaskUuid, Task>,
}

impl MemoryDatastore {
    pub fn new() -> MemoryDatastore {
        MemoryDatastore::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Records) -> T) -> Result<T, Error> {
        let mut records = self
            .inner
            .lock()
            .map_err(|_| Error::internal_error("datastore lock poisoned"))?;
        Ok(f(&mut records))
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn cluster_load(
        &self,
        id: ClusterUuid,
    ) -> Result<Option<Cluster>, Error> {
        self.with(|r| r.clusters.get(&id).cloned())
    }

    async fn cluster_save(&self, cluster: &Cluster) -> Result<(), Error> {
        self.with(|r| {
            r.clusters.insert(cluster.id, cluster.clone());
        })
    }

    async fn cluster_list(&self) -> ListResultVec<Cluster> {
        self.with(|r| r.clusters.values().cloned().collect())
    }

    async fn node_load(&self, id: NodeUuid) -> Result<Option<Node>, Error> {
        self.with(|r| r.nodes.get(&id).cloned())
    }

    async fn node_save(&self, node: &Node) -> Result<(), Error> {
        self.with(|r| {
            r.nodes.insert(node.id, node.clone());
        })
    }

    async fn node_delete(&self, id: NodeUuid) -> Result<(), Error> {
        self.with(|r| {
            r.nodes.remove(&id);
        })
    }

    async fn node_list(&self, cluster_id: ClusterUuid) -> ListResultVec<Node> {
        let mut nodes = self.with(|r| {
            r.nodes
                .values()
                .filter(|n| n.cluster_id == cluster_id)
                .cloned()
                .collect::<Vec<_>>()
        })?;
        nodes.sort_by_key(|n| (n.ordinal, n.id));
        Ok(nodes)
    }

    async fn job_load(&self, id: JobUuid) -> Result<Option<ClusterJob>, Error> {
        self.with(|r| r.jobs.get(&id).cloned())
    }

    async fn job_save(&self, job: &ClusterJob) -> Result<(), Error> {
        self.with(|r| {
            r.jobs.insert(job.id, job.clone());
        })
    }

    async fn job_list_active(&self) -> ListResultVec<ClusterJob> {
        self.with(|r| {
            r.jobs
                .values()
                .filter(|j| !j.status().is_terminal())
                .cloned()
                .collect()
        })
    }

    async fn task_load(&self, id: TaskUuid) -> Result<Option<Task>, Error> {
        self.with(|r| r.tasks.get(&id).cloned())
    }

    async fn task_save(&self, task: &Task) -> Result<(), Error> {
        self.with(|r| {
            r.tasks.insert(task.id, task.clone());
        })
    }

    async fn task_list(&self, job_id: JobUuid) -> ListResultVec<Task> {
        self.with(|r| {
            r.tasks.values().filter(|t| t.job_id == job_id).cloned().collect()
        })
    }
}
