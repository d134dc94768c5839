// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared harness for provisioner integration tests

use camino::Utf8PathBuf;
use dropshot::ConfigLogging;
use dropshot::ConfigLoggingLevel;
use provisioner::app::ClusterCreateParams;
use provisioner::app::ClusterView;
use provisioner::catalog::TemplateCatalog;
use provisioner::config::SchedulerConfig;
use provisioner::config::SolverConfig;
use provisioner::config::StorageConfig;
use provisioner::config::WorkerConfig;
use provisioner::datastore::Datastore;
use provisioner::datastore::MemoryDatastore;
use provisioner::executor::SimExecutor;
use provisioner::Config;
use provisioner::Orchestrator;
use provisioner::Provisioner;
use provisioner_common::typed_uuid::ClusterUuid;
use provisioner_common::typed_uuid::JobUuid;
use provisioner_test_utils::dev::poll::wait_for_condition;
use provisioner_test_utils::dev::poll::CondCheckError;
use provisioner_test_utils::dev::test_setup_log;
use provisioner_test_utils::dev::LogContext;
use provisioner_types::job::ClusterJob;
use provisioner_types::job::JobStatus;
use provisioner_types::task::Task;
use provisioner_types::task::TaskStatus;
use provisioner_types::task::TaskUnit;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Templates the integration tests build clusters from
///
/// - "coordinated": one coordinator and one to three worker nodes, each
///   worker paired with an agent
/// - "ordered": services "a" and "b", where "b" may only install once "a" is
///   running
/// - "leased": a single service, with clusters that expire after a minute
pub const CATALOG: &str = r#"
    schema_version = 1

    [[services]]
    name = "coordinator"
    actions = ["install", "configure", "start", "stop", "remove"]

    [[services]]
    name = "worker"
    actions = ["install", "configure", "start", "stop", "remove"]
    dependencies = { runtime = ["coordinator"] }

    [[services]]
    name = "agent"
    actions = ["install", "start", "stop", "remove"]

    [[services]]
    name = "a"
    actions = ["install", "start", "stop", "remove"]

    [[services]]
    name = "b"
    actions = ["install", "start", "stop", "remove"]
    dependencies = { live = ["a"] }

    [[templates]]
    name = "coordinated"

    [templates.defaults]
    services = ["coordinator", "worker", "agent"]
    hardware_type = "medium"
    image_type = "ubuntu"

    [templates.compatibility]
    services = ["coordinator", "worker", "agent"]

    [templates.constraints.size]
    min = 1
    max = 4

    [templates.constraints.layout]
    must_coexist = [["worker", "agent"]]

    [templates.constraints.services.coordinator.quantities]
    min = 1
    max = 1

    [templates.constraints.services.worker.quantities]
    min = 1
    max = 3

    [[templates]]
    name = "ordered"

    [templates.defaults]
    services = ["a", "b"]
    hardware_type = "medium"
    image_type = "ubuntu"

    [templates.compatibility]
    services = ["a", "b"]

    [templates.constraints.size]
    min = 1
    max = 2

    [[templates]]
    name = "leased"

    [templates.defaults]
    services = ["a"]
    hardware_type = "medium"
    image_type = "ubuntu"

    [templates.compatibility]
    services = ["a"]

    [templates.administration.lease_duration]
    initial = 60
    max = 3600
    step = 600
"#;

pub const OWNER: &str = "test-owner";

pub fn test_config() -> Config {
    Config {
        log: ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info },
        scheduler: SchedulerConfig {
            max_attempts: 3,
            lease_timeout: Duration::from_secs(30),
            lease_wait: Duration::from_millis(100),
            reaper_period: Duration::from_millis(50),
            // Tests activate these explicitly.
            recovery_period: Duration::from_secs(3600),
            expiry_period: Duration::from_secs(3600),
        },
        workers: WorkerConfig { count: 4 },
        solver: SolverConfig::default(),
        storage: StorageConfig::Memory,
        templates: Utf8PathBuf::from("unused"),
    }
}

pub struct TestContext {
    pub logctx: LogContext,
    pub provisioner: Provisioner,
    pub executor: Arc<SimExecutor>,
    pub datastore: Arc<dyn Datastore>,
}

impl TestContext {
    /// Starts a provisioner with the default test configuration on a fresh
    /// in-memory datastore
    pub fn new(test_name: &str) -> TestContext {
        TestContext::with_config(test_name, test_config())
    }

    pub fn with_config(test_name: &str, config: Config) -> TestContext {
        let logctx = test_setup_log(test_name);
        let datastore: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        TestContext::start(logctx, config, datastore)
    }

    pub fn start(
        logctx: LogContext,
        config: Config,
        datastore: Arc<dyn Datastore>,
    ) -> TestContext {
        let executor =
            Arc::new(SimExecutor::new(&logctx.log, Duration::from_millis(1)));
        let catalog = TemplateCatalog::from_toml(CATALOG).unwrap();
        let provisioner = Provisioner::start(
            &config,
            catalog,
            datastore.clone(),
            executor.clone(),
            &logctx.log,
        );
        TestContext { logctx, provisioner, executor, datastore }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        self.provisioner.orchestrator()
    }

    pub async fn create(&self, template: &str, node_count: usize) -> ClusterJob {
        self.orchestrator()
            .cluster_create(ClusterCreateParams {
                name: format!("{template}-test"),
                owner: OWNER.to_string(),
                template: template.to_string(),
                node_count,
                services: None,
                hardware_type: None,
                image_type: None,
            })
            .await
            .unwrap()
    }

    /// Waits for `job` to finish and for its cluster to let go of it
    pub async fn wait_for_job(&self, job_id: JobUuid) -> ClusterJob {
        let datastore = self.datastore.clone();
        wait_for_condition(
            || {
                let datastore = datastore.clone();
                async move {
                    let job = datastore.job_fetch(job_id).await.unwrap();
                    if !job.status().is_terminal() {
                        return Err(CondCheckError::<()>::NotYet);
                    }
                    let cluster =
                        datastore.cluster_fetch(job.cluster_id).await.unwrap();
                    if cluster.active_job == Some(job_id) {
                        return Err(CondCheckError::NotYet);
                    }
                    Ok(job)
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(30),
        )
        .await
        .unwrap()
    }

    /// Creates a cluster and waits for its create job to succeed
    pub async fn create_and_wait(
        &self,
        template: &str,
        node_count: usize,
    ) -> ClusterView {
        let job = self.create(template, node_count).await;
        let job = self.wait_for_job(job.id).await;
        assert_eq!(job.status(), JobStatus::Complete, "{:?}", job.message);
        self.orchestrator().cluster_view(job.cluster_id).await.unwrap()
    }

    /// Waits until some task of `job` matching `matches` reaches `status`
    pub async fn wait_for_task(
        &self,
        job_id: JobUuid,
        status: TaskStatus,
        matches: impl Fn(&TaskUnit) -> bool,
    ) -> Task {
        let datastore = self.datastore.clone();
        let matches = &matches;
        wait_for_condition(
            || {
                let datastore = datastore.clone();
                async move {
                    datastore
                        .task_list(job_id)
                        .await
                        .unwrap()
                        .into_iter()
                        .find(|t| t.status == status && matches(&t.unit))
                        .ok_or(CondCheckError::<()>::NotYet)
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(30),
        )
        .await
        .unwrap()
    }

    pub async fn view(&self, cluster_id: ClusterUuid) -> ClusterView {
        self.orchestrator().cluster_view(cluster_id).await.unwrap()
    }

    pub async fn teardown(self) {
        self.provisioner.shutdown().await;
        self.logctx.cleanup_successful();
    }
}

/// Services running on each node, in ordinal order
pub fn node_services(view: &ClusterView) -> Vec<BTreeSet<String>> {
    view.nodes.iter().map(|n| n.services.clone()).collect()
}

pub fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn is_service_action(
    unit: &TaskUnit,
    service: &str,
    action: provisioner_types::service::ProvisionerAction,
) -> bool {
    unit.service.as_deref() == Some(service) && unit.action == action
}

/// Tasks of the view's job in `status`
pub fn tasks_in(view: &ClusterView, status: TaskStatus) -> Vec<&Task> {
    view.tasks.iter().filter(|t| t.status == status).collect()
}
