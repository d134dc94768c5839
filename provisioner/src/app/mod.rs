// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Orchestrator-level facilities
//!
//! [`Orchestrator`] is the provisioner's public contract: the operations a
//! front end invokes on clusters, plus the housekeeping that background tasks
//! drive (recovery, lease reclamation, cluster expiration).  Cluster
//! operations live in [`cluster`]; each one that changes a cluster plans a
//! job and hands it to a [`job::JobRunner`].

use crate::catalog::TemplateCatalog;
use crate::config::SchedulerConfig;
use crate::datastore::Datastore;
use crate::dispatcher::Dispatcher;
use crate::dispatcher::Withdraw;
use crate::locks::ClusterLocks;
use crate::retry::RetryPolicy;
use chrono::DateTime;
use chrono::Utc;
use job::JobContext;
use job::JobRegistry;
use job::JobRunner;
use provisioner_common::api::Error;
use provisioner_common::typed_uuid::JobUuid;
use provisioner_types::cluster::ClusterEvent;
use provisioner_types::job::JobStatus;
use provisioner_types::job::OperationKind;
use provisioner_types::task::TaskStatus;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::Arc;

pub mod cluster;
pub(crate) mod job;

pub use cluster::ClusterCreateParams;
pub use cluster::ClusterView;
pub use cluster::NodePropertiesRequest;

/// Manages clusters and the jobs that change them
pub struct Orchestrator {
    log: Logger,
    catalog: Arc<TemplateCatalog>,
    datastore: Arc<dyn Datastore>,
    dispatcher: Arc<Dispatcher>,
    locks: Arc<ClusterLocks>,
    jobs: Arc<JobRegistry>,
    retry: RetryPolicy,
    search_budget: usize,
}

/// What a recovery pass did
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct RecoveryReport {
    /// unfinished jobs whose runners were restarted
    pub resumed: usize,
    /// finished jobs whose outcome hadn't reached their cluster yet
    pub settled: usize,
    /// unfinished jobs their cluster had no claim on, now cancelled
    pub abandoned: usize,
}

impl Orchestrator {
    pub fn new(
        log: &Logger,
        catalog: TemplateCatalog,
        datastore: Arc<dyn Datastore>,
        dispatcher: Arc<Dispatcher>,
        scheduler: &SchedulerConfig,
        search_budget: usize,
    ) -> Orchestrator {
        Orchestrator {
            log: log.new(o!("component" => "Orchestrator")),
            catalog: Arc::new(catalog),
            datastore,
            dispatcher,
            locks: Arc::new(ClusterLocks::new()),
            jobs: Arc::new(JobRegistry::default()),
            retry: RetryPolicy { max_attempts: scheduler.max_attempts },
            search_budget,
        }
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Number of jobs with a live control loop
    pub fn running_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Stops every job runner without touching persisted state
    pub fn shutdown(&self) {
        let stopped = self.jobs.abort_all();
        info!(self.log, "stopped job runners"; "count" => stopped);
    }

    fn job_context(&self) -> JobContext {
        JobContext {
            log: self.log.clone(),
            datastore: self.datastore.clone(),
            dispatcher: self.dispatcher.clone(),
            locks: self.locks.clone(),
            registry: self.jobs.clone(),
            retry: self.retry,
        }
    }

    /// Restarts the control loop of every unfinished job that doesn't have
    /// one, and applies the outcome of finished jobs whose cluster still
    /// names them as active
    ///
    /// Safe to run at any time; jobs with a live runner are left alone.  A
    /// job that isn't its cluster's active job was abandoned partway through
    /// being started or superseded, and is cancelled.
    pub async fn recover(&self) -> Result<RecoveryReport, Error> {
        let mut report = RecoveryReport::default();
        for listed in self.datastore.job_list_active().await? {
            if self.jobs.is_running(listed.id) {
                continue;
            }
            // Jobs are started while holding this, so a job that is being
            // started right now is either still unsaved or already running.
            let _guard = self.locks.records().await;
            if self.jobs.is_running(listed.id) {
                continue;
            }
            let job = self.datastore.job_fetch(listed.id).await?;
            if job.status().is_terminal() {
                continue;
            }
            let cluster = self.datastore.cluster_fetch(job.cluster_id).await?;
            if cluster.active_job != Some(job.id) {
                // A delete that took the cluster over names itself instead.
                let reason = match cluster.active_job {
                    Some(_) => "superseded by delete",
                    None => "never started",
                };
                warn!(self.log, "cancelling job that isn't its cluster's";
                    "job_id" => %job.id,
                    "cluster_id" => %job.cluster_id,
                    "reason" => reason,
                );
                self.cancel_orphaned_job(job.id, reason).await?;
                report.abandoned += 1;
                continue;
            }
            if let Err(error) = self.locks.acquire(job.cluster_id, job.id) {
                warn!(self.log, "not resuming job";
                    "job_id" => %job.id,
                    "error" => %error,
                );
                continue;
            }
            let tasks = self.datastore.task_list(job.id).await?;
            info!(self.log, "resuming job";
                "job_id" => %job.id,
                "cluster_id" => %job.cluster_id,
                "tasks" => tasks.len(),
            );
            JobRunner::new(&self.job_context(), job, tasks).spawn();
            report.resumed += 1;
        }

        let cx = self.job_context();
        for cluster in self.datastore.cluster_list().await? {
            let Some(job_id) = cluster.active_job else {
                continue;
            };
            if self.jobs.is_running(job_id) {
                continue;
            }
            let job = self.datastore.job_fetch(job_id).await?;
            let event = match job.status() {
                JobStatus::Active => continue,
                JobStatus::Complete => ClusterEvent::JobSucceeded {
                    operation: job.operation.kind(),
                },
                JobStatus::Failed => ClusterEvent::JobFailed {
                    operation: job.operation.kind(),
                },
                // The job that cancelled it never got as far as taking
                // over the cluster.
                JobStatus::Cancelled => {
                    if job::release_cancelled(&cx, &job).await? {
                        report.settled += 1;
                    }
                    continue;
                }
            };
            // Another job may have taken over since the cluster was listed.
            if self.locks.acquire(cluster.id, job_id).is_err() {
                continue;
            }
            job::settle_cluster(&cx, &self.log, &job, event).await?;
            report.settled += 1;
        }
        Ok(report)
    }

    /// Returns tasks whose leases have run out to the queue
    pub fn reclaim_leases(&self) -> usize {
        self.dispatcher.reclaim_expired()
    }

    /// Deletes every cluster whose lease ran out before `now`, returning how
    /// many deletions were started
    pub async fn expire_clusters(
        &self,
        now: DateTime<Utc>,
    ) -> Result<usize, Error> {
        let mut expired = 0;
        for cluster in self.datastore.cluster_list().await? {
            if cluster.status.is_terminated() {
                continue;
            }
            if !cluster.time_expires.is_some_and(|expiry| expiry <= now) {
                continue;
            }
            if let Some(job_id) = cluster.active_job {
                let job = self.datastore.job_fetch(job_id).await?;
                if job.operation.kind() == OperationKind::Delete {
                    continue;
                }
            }
            info!(self.log, "cluster lease expired"; "cluster_id" => %cluster.id);
            match self.cluster_delete(cluster.id).await {
                Ok(_) => expired += 1,
                Err(error) => {
                    warn!(self.log, "failed to delete expired cluster";
                        "cluster_id" => %cluster.id,
                        "error" => %error,
                    );
                }
            }
        }
        Ok(expired)
    }

    /// Cancels a job that has no live runner by rewriting its persisted
    /// state
    ///
    /// The caller holds the records guard, so recovery can't restart the job
    /// underneath it.
    async fn cancel_orphaned_job(
        &self,
        job_id: JobUuid,
        reason: &str,
    ) -> Result<(), Error> {
        let mut job = self.datastore.job_fetch(job_id).await?;
        if job.status().is_terminal() {
            return Ok(());
        }
        self.dispatcher.withdraw_job(job_id, Withdraw::All);
        for mut task in self.datastore.task_list(job_id).await? {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Skipped;
                task.lease = None;
                self.datastore.task_save(&task).await?;
            }
        }
        job.finish(
            JobStatus::Cancelled,
            Utc::now(),
            Some(reason.to_string()),
        )
        .map_err(|e| Error::internal_error(&e.to_string()))?;
        self.datastore.job_save(&job).await
    }
}
