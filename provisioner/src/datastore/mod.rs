// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistence for clusters, nodes, jobs, and tasks
//!
//! Everything the orchestrator decides is written here before it is acted
//! upon, so that recovery can rebuild all in-flight work from what is stored.
//! Backends implement [`Datastore`] independently; nothing else in the crate
//! knows which one is in use.  A backend that cannot reach its storage
//! reports [`Error::PersistenceUnavailable`].

use async_trait::async_trait;
use provisioner_common::api::Error;
use provisioner_common::api::ListResultVec;
use provisioner_common::api::LookupResult;
use provisioner_common::api::ResourceType;
use provisioner_common::typed_uuid::ClusterUuid;
use provisioner_common::typed_uuid::JobUuid;
use provisioner_common::typed_uuid::NodeUuid;
use provisioner_common::typed_uuid::TaskUuid;
use provisioner_types::cluster::Cluster;
use provisioner_types::cluster::Node;
use provisioner_types::job::ClusterJob;
use provisioner_types::task::Task;

mod file;
mod memory;

pub use file::FileDatastore;
pub use memory::MemoryDatastore;

#[async_trait]
pub trait Datastore: Send + Sync {
    async fn cluster_load(
        &self,
        id: ClusterUuid,
    ) -> Result<Option<Cluster>, Error>;
    async fn cluster_save(&self, cluster: &Cluster) -> Result<(), Error>;
    async fn cluster_list(&self) -> ListResultVec<Cluster>;

    async fn node_load(&self, id: NodeUuid) -> Result<Option<Node>, Error>;
    async fn node_save(&self, node: &Node) -> Result<(), Error>;
    /// Deleting a node that doesn't exist succeeds.
    async fn node_delete(&self, id: NodeUuid) -> Result<(), Error>;
    /// Lists a cluster's nodes, ordered by ordinal
    async fn node_list(&self, cluster_id: ClusterUuid) -> ListResultVec<Node>;

    async fn job_load(&self, id: JobUuid) -> Result<Option<ClusterJob>, Error>;
    async fn job_save(&self, job: &ClusterJob) -> Result<(), Error>;
    /// Lists jobs that haven't finished
    async fn job_list_active(&self) -> ListResultVec<ClusterJob>;

    async fn task_load(&self, id: TaskUuid) -> Result<Option<Task>, Error>;
    async fn task_save(&self, task: &Task) -> Result<(), Error>;
    async fn task_list(&self, job_id: JobUuid) -> ListResultVec<Task>;

    async fn cluster_fetch(&self, id: ClusterUuid) -> LookupResult<Cluster> {
        self.cluster_load(id).await?.ok_or_else(|| {
            Error::not_found_by_id(ResourceType::Cluster, id.as_untyped_uuid())
        })
    }

    async fn node_fetch(&self, id: NodeUuid) -> LookupResult<Node> {
        self.node_load(id).await?.ok_or_else(|| {
            Error::not_found_by_id(ResourceType::Node, id.as_untyped_uuid())
        })
    }

    async fn job_fetch(&self, id: JobUuid) -> LookupResult<ClusterJob> {
        self.job_load(id).await?.ok_or_else(|| {
            Error::not_found_by_id(ResourceType::ClusterJob, id.as_untyped_uuid())
        })
    }
}
