// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster provisioner
//!
//! Turns requests to create or change a cluster into a job: a dependency
//! graph of per-node, per-service tasks.  Workers lease ready tasks from the
//! [`dispatcher`], perform them through an [`executor::ActionExecutor`], and
//! report back.  Each job's control loop unlocks dependents as tasks finish,
//! retries failures, and moves the cluster through its lifecycle once the
//! job settles.

pub mod app;
pub mod background;
pub mod catalog;
pub mod config;
pub mod datastore;
pub mod dispatcher;
pub mod executor;
pub mod locks;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use app::Orchestrator;
pub use config::Config;

use background::tasks::cluster_expiry::ClusterExpiry;
use background::tasks::job_recovery::JobRecovery;
use background::tasks::lease_reaper::LeaseReaper;
use background::Driver;
use background::TaskName;
use catalog::TemplateCatalog;
use config::StorageConfig;
use datastore::Datastore;
use datastore::FileDatastore;
use datastore::MemoryDatastore;
use dispatcher::Dispatcher;
use executor::ActionExecutor;
use provisioner_common::api::Error;
use slog::info;
use slog::o;
use slog::Logger;
use std::sync::Arc;
use worker::WorkerPool;

/// Opens the datastore described by `config`
pub async fn open_datastore(
    config: &StorageConfig,
) -> Result<Arc<dyn Datastore>, Error> {
    Ok(match config {
        StorageConfig::Memory => Arc::new(MemoryDatastore::new()),
        StorageConfig::File { path } => {
            Arc::new(FileDatastore::new(path).await?)
        }
    })
}

/// Handles for the background tasks the provisioner runs
pub struct BackgroundTasks {
    pub lease_reaper: TaskName,
    pub job_recovery: TaskName,
    pub cluster_expiry: TaskName,
}

/// A running provisioner: the orchestrator, its workers, and its background
/// tasks
pub struct Provisioner {
    log: Logger,
    orchestrator: Arc<Orchestrator>,
    workers: WorkerPool,
    driver: Driver,
    background_tasks: BackgroundTasks,
}

impl Provisioner {
    /// Starts a provisioner on top of `datastore`
    ///
    /// Jobs that were in flight when the datastore was last used are resumed
    /// by the first activation of the job recovery task, which happens as
    /// soon as it is registered.
    pub fn start(
        config: &Config,
        catalog: TemplateCatalog,
        datastore: Arc<dyn Datastore>,
        executor: Arc<dyn ActionExecutor>,
        log: &Logger,
    ) -> Provisioner {
        let log = log.new(o!("name" => "provisioner"));
        info!(log, "starting provisioner";
            "workers" => config.workers.count,
            "templates" => catalog.templates().count(),
        );

        let dispatcher = Arc::new(Dispatcher::new(&log));
        let orchestrator = Arc::new(Orchestrator::new(
            &log,
            catalog,
            datastore,
            Arc::clone(&dispatcher),
            &config.scheduler,
            config.solver.search_budget,
        ));

        let workers = WorkerPool::start(
            &log,
            config.workers.count,
            dispatcher,
            executor,
            config.scheduler.lease_timeout,
            config.scheduler.lease_wait,
        );

        let mut driver = Driver::new();
        let background_tasks = BackgroundTasks {
            lease_reaper: driver.register(
                "lease_reaper",
                "returns tasks whose worker lease expired to the queue",
                config.scheduler.reaper_period,
                Box::new(LeaseReaper::new(Arc::clone(&orchestrator))),
                &log,
            ),
            job_recovery: driver.register(
                "job_recovery",
                "resumes unfinished jobs that have no control loop",
                config.scheduler.recovery_period,
                Box::new(JobRecovery::new(Arc::clone(&orchestrator))),
                &log,
            ),
            cluster_expiry: driver.register(
                "cluster_expiry",
                "deletes clusters whose lease has run out",
                config.scheduler.expiry_period,
                Box::new(ClusterExpiry::new(Arc::clone(&orchestrator))),
                &log,
            ),
        };

        Provisioner { log, orchestrator, workers, driver, background_tasks }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn background_tasks(&self) -> &BackgroundTasks {
        &self.background_tasks
    }

    /// Stops the background tasks, the job runners, and the workers
    ///
    /// Job state is left as persisted.  A provisioner started later on the
    /// same datastore picks the jobs back up.
    pub async fn shutdown(self) {
        info!(self.log, "shutting down");
        drop(self.driver);
        self.orchestrator.shutdown();
        self.workers.shutdown().await;
    }
}
