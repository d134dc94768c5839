// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resuming jobs after a restart or a storage outage

use crate::common::is_service_action;
use crate::common::set;
use crate::common::test_config;
use crate::common::TestContext;
use crate::common::CATALOG;
use assert_matches::assert_matches;
use async_trait::async_trait;
use camino_tempfile::Utf8TempDir;
use provisioner::app::RecoveryReport;
use provisioner::catalog::TemplateCatalog;
use provisioner::config::StorageConfig;
use provisioner::datastore::Datastore;
use provisioner::datastore::FileDatastore;
use provisioner::datastore::MemoryDatastore;
use provisioner::dispatcher::Dispatcher;
use provisioner::executor::Fault;
use provisioner::executor::UnitMatcher;
use provisioner::open_datastore;
use provisioner::Orchestrator;
use provisioner_common::api::Error;
use provisioner_common::api::ListResultVec;
use provisioner_common::typed_uuid::ClusterUuid;
use provisioner_common::typed_uuid::JobUuid;
use provisioner_common::typed_uuid::NodeUuid;
use provisioner_common::typed_uuid::TaskUuid;
use provisioner_test_utils::dev::poll::wait_for_condition;
use provisioner_test_utils::dev::poll::CondCheckError;
use provisioner_test_utils::dev::test_setup_log;
use provisioner_types::cluster::Cluster;
use provisioner_types::cluster::ClusterStatus;
use provisioner_types::cluster::Node;
use provisioner_types::job::ClusterJob;
use provisioner_types::job::JobStatus;
use provisioner_types::service::ProvisionerAction;
use provisioner_types::task::Task;
use provisioner_types::task::TaskStatus;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_restart_resumes_jobs() {
    let logctx = test_setup_log("test_restart_resumes_jobs");
    let dir = Utf8TempDir::new().unwrap();
    let mut config = test_config();
    config.storage = StorageConfig::File { path: dir.path().to_owned() };

    let datastore = open_datastore(&config.storage).await.unwrap();
    let before = TestContext::start(logctx, config.clone(), datastore);
    before.executor.inject(
        UnitMatcher::service_action("worker", ProvisionerAction::Install),
        Fault::Hold,
    );
    let job = before.create("coordinated", 3).await;
    before
        .wait_for_task(job.id, TaskStatus::InProgress, |unit| {
            is_service_action(unit, "worker", ProvisionerAction::Install)
        })
        .await;

    // Stop the first provisioner mid-job.  Its worker never reports back.
    before.provisioner.shutdown().await;
    let stored = before.datastore.job_fetch(job.id).await.unwrap();
    assert_eq!(stored.status(), JobStatus::Active);

    // A second provisioner on the same directory picks the job up.
    let datastore: Arc<dyn Datastore> =
        Arc::new(FileDatastore::new(dir.path()).await.unwrap());
    let after = TestContext::start(before.logctx, config, datastore);
    let job = after.wait_for_job(job.id).await;
    assert_eq!(job.status(), JobStatus::Complete);

    let view = after.view(job.cluster_id).await;
    assert_eq!(view.cluster.status, ClusterStatus::Active);
    assert!(view.tasks.iter().all(|t| t.status == TaskStatus::Complete));
    assert_eq!(
        view.nodes.iter().map(|n| n.services.clone()).collect::<Vec<_>>(),
        vec![
            set(&["coordinator"]),
            set(&["agent", "worker"]),
            set(&["agent", "worker"]),
        ]
    );
    // The held installs ran once more, on the new provisioner's workers.
    let reinstalls = after
        .executor
        .history()
        .into_iter()
        .filter(|e| {
            is_service_action(&e.unit, "worker", ProvisionerAction::Install)
        })
        .count();
    assert_eq!(reinstalls, 2);
    after.teardown().await;
}

/// Memory datastore with switchable misbehavior
struct FaultyDatastore {
    inner: MemoryDatastore,
    /// task writes fail
    fail_task_saves: AtomicBool,
    /// writes of finished jobs fail
    fail_finished_job_saves: AtomicBool,
    /// writes naming a cluster's active job take a while
    slow_launches: AtomicBool,
}

impl FaultyDatastore {
    fn new() -> FaultyDatastore {
        FaultyDatastore {
            inner: MemoryDatastore::new(),
            fail_task_saves: AtomicBool::new(false),
            fail_finished_job_saves: AtomicBool::new(false),
            slow_launches: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Datastore for FaultyDatastore {
    async fn cluster_load(
        &self,
        id: ClusterUuid,
    ) -> Result<Option<Cluster>, Error> {
        self.inner.cluster_load(id).await
    }
    async fn cluster_save(&self, cluster: &Cluster) -> Result<(), Error> {
        if cluster.active_job.is_some()
            && self.slow_launches.load(Ordering::SeqCst)
        {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        self.inner.cluster_save(cluster).await
    }
    async fn cluster_list(&self) -> ListResultVec<Cluster> {
        self.inner.cluster_list().await
    }
    async fn node_load(&self, id: NodeUuid) -> Result<Option<Node>, Error> {
        self.inner.node_load(id).await
    }
    async fn node_save(&self, node: &Node) -> Result<(), Error> {
        self.inner.node_save(node).await
    }
    async fn node_delete(&self, id: NodeUuid) -> Result<(), Error> {
        self.inner.node_delete(id).await
    }
    async fn node_list(&self, cluster_id: ClusterUuid) -> ListResultVec<Node> {
        self.inner.node_list(cluster_id).await
    }
    async fn job_load(&self, id: JobUuid) -> Result<Option<ClusterJob>, Error> {
        self.inner.job_load(id).await
    }
    async fn job_save(&self, job: &ClusterJob) -> Result<(), Error> {
        if job.status().is_terminal()
            && self.fail_finished_job_saves.load(Ordering::SeqCst)
        {
            return Err(Error::unavail("job storage is offline"));
        }
        self.inner.job_save(job).await
    }
    async fn job_list_active(&self) -> ListResultVec<ClusterJob> {
        self.inner.job_list_active().await
    }
    async fn task_load(&self, id: TaskUuid) -> Result<Option<Task>, Error> {
        self.inner.task_load(id).await
    }
    async fn task_save(&self, task: &Task) -> Result<(), Error> {
        if self.fail_task_saves.load(Ordering::SeqCst) {
            return Err(Error::unavail("task storage is offline"));
        }
        self.inner.task_save(task).await
    }
    async fn task_list(&self, job_id: JobUuid) -> ListResultVec<Task> {
        self.inner.task_list(job_id).await
    }
}

/// Waits for every job runner to exit
async fn wait_for_runners(orchestrator: &Orchestrator) {
    wait_for_condition(
        || {
            let running = orchestrator.running_jobs();
            async move {
                if running == 0 {
                    Ok(())
                } else {
                    Err(CondCheckError::<()>::NotYet)
                }
            }
        },
        &Duration::from_millis(10),
        &Duration::from_secs(30),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_storage_outage_pauses_job() {
    let logctx = test_setup_log("test_storage_outage_pauses_job");
    let flaky = Arc::new(FaultyDatastore::new());
    let cx = TestContext::start(logctx, test_config(), flaky.clone());
    cx.executor.inject(
        UnitMatcher::service_action("b", ProvisionerAction::Install),
        Fault::Hold,
    );
    let job = cx.create("ordered", 1).await;
    cx.wait_for_task(job.id, TaskStatus::InProgress, |unit| {
        is_service_action(unit, "b", ProvisionerAction::Install)
    })
    .await;

    // The outcome of the held install can't be recorded, so the job's
    // control loop stops where it is.
    flaky.fail_task_saves.store(true, Ordering::SeqCst);
    cx.executor.release();
    wait_for_runners(cx.orchestrator()).await;
    let stalled = cx.datastore.job_fetch(job.id).await.unwrap();
    assert_eq!(stalled.status(), JobStatus::Active);
    let cluster = cx.datastore.cluster_fetch(job.cluster_id).await.unwrap();
    assert_eq!(cluster.active_job, Some(job.id));

    flaky.fail_task_saves.store(false, Ordering::SeqCst);
    let recovery = &cx.provisioner.background_tasks().job_recovery;
    cx.provisioner.driver().activate(recovery);
    let job = cx.wait_for_job(job.id).await;
    assert_eq!(job.status(), JobStatus::Complete);
    let view = cx.view(job.cluster_id).await;
    assert_eq!(view.cluster.status, ClusterStatus::Active);
    assert_eq!(view.cluster.services, set(&["a", "b"]));

    // The first pass ran at startup, before anything needed resuming.
    let driver = cx.provisioner.driver();
    let details = wait_for_condition(
        || {
            let status = driver.task_status(recovery);
            async move {
                match status.last.completion() {
                    Some(last) if last.iteration >= 2 => {
                        Ok(last.details.clone())
                    }
                    _ => Err(CondCheckError::<()>::NotYet),
                }
            }
        },
        &Duration::from_millis(10),
        &Duration::from_secs(10),
    )
    .await
    .unwrap();
    assert_eq!(details["resumed"], 1);
    cx.teardown().await;
}

#[tokio::test]
async fn test_recovery_finishes_interrupted_failure() {
    let logctx = test_setup_log("test_recovery_finishes_interrupted_failure");
    let faulty = Arc::new(FaultyDatastore::new());
    let cx = TestContext::start(logctx, test_config(), faulty.clone());
    cx.executor.inject(
        UnitMatcher::service_action("b", ProvisionerAction::Install),
        Fault::Fail { times: None },
    );

    // The job runs out of attempts, but its outcome can't be written, so
    // the runner stops with the failure only partly recorded.
    faulty.fail_finished_job_saves.store(true, Ordering::SeqCst);
    let job = cx.create("ordered", 1).await;
    wait_for_runners(cx.orchestrator()).await;
    let stalled = cx.datastore.job_fetch(job.id).await.unwrap();
    assert_eq!(stalled.status(), JobStatus::Active);
    let tasks = cx.datastore.task_list(job.id).await.unwrap();
    assert!(tasks.iter().any(|t| t.status == TaskStatus::Failed));
    assert!(tasks.iter().all(|t| t.status.is_terminal()));

    faulty.fail_finished_job_saves.store(false, Ordering::SeqCst);
    let report = cx.orchestrator().recover().await.unwrap();
    assert_eq!(report.resumed, 1);
    let job = cx.wait_for_job(job.id).await;
    assert_eq!(job.status(), JobStatus::Failed);
    assert!(job.message.as_deref().unwrap().contains("simulated failure"));
    wait_for_runners(cx.orchestrator()).await;

    let view = cx.view(job.cluster_id).await;
    assert_eq!(view.cluster.status, ClusterStatus::Failed);
    assert_eq!(view.cluster.active_job, None);
    // Resuming didn't run anything again.
    let installs = cx
        .executor
        .history()
        .into_iter()
        .filter(|e| is_service_action(&e.unit, "b", ProvisionerAction::Install))
        .count();
    assert_eq!(installs, 3);
    cx.teardown().await;
}

#[tokio::test]
async fn test_recovery_leaves_starting_job_alone() {
    let logctx = test_setup_log("test_recovery_leaves_starting_job_alone");
    let faulty = Arc::new(FaultyDatastore::new());
    let cx = TestContext::start(logctx, test_config(), faulty.clone());
    let orchestrator = cx.orchestrator();

    // Recovery runs after the job is saved but before the cluster names it.
    faulty.slow_launches.store(true, Ordering::SeqCst);
    let (job, report) = tokio::join!(cx.create("ordered", 1), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        orchestrator.recover().await.unwrap()
    });
    assert_eq!(report.resumed, 0);
    assert_eq!(report.abandoned, 0);

    let job = cx.wait_for_job(job.id).await;
    assert_eq!(job.status(), JobStatus::Complete);
    let view = cx.view(job.cluster_id).await;
    assert_eq!(view.cluster.status, ClusterStatus::Active);
    assert!(view.tasks.iter().all(|t| t.status == TaskStatus::Complete));
    let installs = cx
        .executor
        .history()
        .into_iter()
        .filter(|e| is_service_action(&e.unit, "b", ProvisionerAction::Install))
        .count();
    assert_eq!(installs, 1);
    cx.teardown().await;
}

#[tokio::test]
async fn test_cluster_record_locks_before_recovery() {
    let logctx = test_setup_log("test_cluster_record_locks_before_recovery");
    let dir = Utf8TempDir::new().unwrap();
    let mut config = test_config();
    config.storage = StorageConfig::File { path: dir.path().to_owned() };

    let datastore = open_datastore(&config.storage).await.unwrap();
    let before = TestContext::start(logctx, config.clone(), datastore);
    before.executor.inject(
        UnitMatcher::service_action("b", ProvisionerAction::Install),
        Fault::Hold,
    );
    let job = before.create("ordered", 1).await;
    before
        .wait_for_task(job.id, TaskStatus::InProgress, |unit| {
            is_service_action(unit, "b", ProvisionerAction::Install)
        })
        .await;
    before.provisioner.shutdown().await;

    // A fresh orchestrator that hasn't run recovery knows about the job
    // only from the cluster's record.
    let log = &before.logctx.log;
    let datastore: Arc<dyn Datastore> =
        Arc::new(FileDatastore::new(dir.path()).await.unwrap());
    let orchestrator = Orchestrator::new(
        log,
        TemplateCatalog::from_toml(CATALOG).unwrap(),
        datastore.clone(),
        Arc::new(Dispatcher::new(log)),
        &config.scheduler,
        config.solver.search_budget,
    );
    assert_matches!(
        orchestrator.cluster_resize(job.cluster_id, 2).await,
        Err(Error::Conflict { .. })
    );
    assert_eq!(orchestrator.running_jobs(), 0);

    // A delete still takes over, cancelling the job it found.
    let delete = orchestrator.cluster_delete(job.cluster_id).await.unwrap();
    let cancelled = datastore.job_fetch(job.id).await.unwrap();
    assert_eq!(cancelled.status(), JobStatus::Cancelled);
    let tasks = datastore.task_list(job.id).await.unwrap();
    assert!(tasks.iter().all(|t| t.status.is_terminal()));
    let cluster = datastore.cluster_fetch(job.cluster_id).await.unwrap();
    assert_eq!(cluster.active_job, Some(delete.id));

    // Nothing is left for recovery: one job is finished and the other has
    // a runner.
    let report = orchestrator.recover().await.unwrap();
    assert_eq!(report, RecoveryReport::default());
    assert_eq!(orchestrator.running_jobs(), 1);

    orchestrator.shutdown();
    before.logctx.cleanup_successful();
}
