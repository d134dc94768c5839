// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-cluster advisory locks
//!
//! At most one job operates on a cluster at a time.  The lock names the job
//! holding it and is mirrored in the cluster record's `active_job` so that
//! it can be re-established after a restart.
//!
//! Separately, updates to cluster records are read-modify-write sequences
//! made by both job runners and API calls.  Those are serialized with
//! [`ClusterLocks::records()`].

use provisioner_common::api::Error;
use provisioner_common::typed_uuid::ClusterUuid;
use provisioner_common::typed_uuid::JobUuid;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;

#[derive(Default)]
pub struct ClusterLocks {
    held: Mutex<BTreeMap<ClusterUuid, JobUuid>>,
    records: tokio::sync::Mutex<()>,
}

impl ClusterLocks {
    pub fn new() -> ClusterLocks {
        ClusterLocks::default()
    }

    fn held(&self) -> MutexGuard<'_, BTreeMap<ClusterUuid, JobUuid>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes the lock on `cluster_id` for `job_id`
    pub fn acquire(
        &self,
        cluster_id: ClusterUuid,
        job_id: JobUuid,
    ) -> Result<(), Error> {
        let mut held = self.held();
        match held.get(&cluster_id) {
            Some(holder) if *holder != job_id => Err(Error::conflict(&format!(
                "cluster {cluster_id} is busy with job {holder}"
            ))),
            _ => {
                held.insert(cluster_id, job_id);
                Ok(())
            }
        }
    }

    /// Hands the lock from `from` to `to`, returning whether `from` held it
    pub fn transfer(
        &self,
        cluster_id: ClusterUuid,
        from: JobUuid,
        to: JobUuid,
    ) -> bool {
        let mut held = self.held();
        match held.get_mut(&cluster_id) {
            Some(holder) if *holder == from => {
                *holder = to;
                true
            }
            _ => false,
        }
    }

    /// Releases the lock if `job_id` holds it
    pub fn release(&self, cluster_id: ClusterUuid, job_id: JobUuid) -> bool {
        let mut held = self.held();
        if held.get(&cluster_id) == Some(&job_id) {
            held.remove(&cluster_id);
            true
        } else {
            false
        }
    }

    pub fn holder(&self, cluster_id: ClusterUuid) -> Option<JobUuid> {
        self.held().get(&cluster_id).copied()
    }

    /// Serializes read-modify-write updates of cluster records
    pub async fn records(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.records.lock().await
    }
}
