// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Failed tasks are retried, then fail their job

use crate::common::is_service_action;
use crate::common::set;
use crate::common::tasks_in;
use crate::common::TestContext;
use crate::common::OWNER;
use provisioner::app::ClusterCreateParams;
use provisioner::executor::Fault;
use provisioner::executor::UnitMatcher;
use provisioner_types::cluster::ClusterStatus;
use provisioner_types::job::JobStatus;
use provisioner_types::service::ProvisionerAction;
use provisioner_types::task::TaskStatus;

#[tokio::test]
async fn test_persistent_failure_fails_create() {
    let cx = TestContext::new("test_persistent_failure_fails_create");
    cx.executor.inject(
        UnitMatcher::service_action("b", ProvisionerAction::Install),
        Fault::Fail { times: None },
    );
    let job = cx.create("ordered", 1).await;
    let job = cx.wait_for_job(job.id).await;
    assert_eq!(job.status(), JobStatus::Failed);
    assert!(job.message.as_deref().unwrap().contains("simulated failure"));

    let attempts: Vec<_> = cx
        .executor
        .history()
        .into_iter()
        .filter(|e| is_service_action(&e.unit, "b", ProvisionerAction::Install))
        .collect();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|e| !e.succeeded));
    assert_eq!(
        attempts.iter().map(|e| e.attempt).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    let view = cx.view(job.cluster_id).await;
    assert_eq!(view.cluster.status, ClusterStatus::Failed);
    assert_eq!(view.cluster.active_job, None);
    // Only what actually got installed is left on the cluster.
    assert_eq!(view.cluster.services, set(&["a"]));
    assert_eq!(view.nodes[0].services, set(&["a"]));

    let failed = tasks_in(&view, TaskStatus::Failed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 3);
    assert!(is_service_action(&failed[0].unit, "b", ProvisionerAction::Install));
    let skipped = tasks_in(&view, TaskStatus::Skipped);
    assert_eq!(skipped.len(), 1);
    assert!(is_service_action(&skipped[0].unit, "b", ProvisionerAction::Start));

    let report = view.report.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].attempts, 3);
    assert_eq!(report.skipped.len(), 1);
    assert!(report.pending.is_empty());
    // node create, a install, a start
    assert_eq!(report.succeeded.len(), 3);
    cx.teardown().await;
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let cx = TestContext::new("test_transient_failure_is_retried");
    cx.executor.inject(
        UnitMatcher::service_action("b", ProvisionerAction::Install),
        Fault::Fail { times: Some(2) },
    );
    let view = cx.create_and_wait("ordered", 1).await;
    assert_eq!(view.cluster.status, ClusterStatus::Active);

    let install = view
        .tasks
        .iter()
        .find(|t| is_service_action(&t.unit, "b", ProvisionerAction::Install))
        .unwrap();
    assert_eq!(install.status, TaskStatus::Complete);
    assert_eq!(install.attempts, 2);
    assert!(install.last_error.is_some());
    cx.teardown().await;
}

#[tokio::test]
async fn test_failed_change_leaves_cluster_incomplete() {
    let cx = TestContext::new("test_failed_change_leaves_cluster_incomplete");
    let orchestrator = cx.orchestrator();
    let job = orchestrator
        .cluster_create(ClusterCreateParams {
            name: "partial".to_string(),
            owner: OWNER.to_string(),
            template: "ordered".to_string(),
            node_count: 1,
            services: Some(set(&["a"])),
            hardware_type: None,
            image_type: None,
        })
        .await
        .unwrap();
    assert_eq!(cx.wait_for_job(job.id).await.status(), JobStatus::Complete);
    let cluster_id = job.cluster_id;

    cx.executor.inject(
        UnitMatcher::service_action("b", ProvisionerAction::Start),
        Fault::Fail { times: None },
    );
    let add = orchestrator
        .cluster_add_services(cluster_id, set(&["b"]))
        .await
        .unwrap();
    assert_eq!(cx.wait_for_job(add.id).await.status(), JobStatus::Failed);
    let view = cx.view(cluster_id).await;
    assert_eq!(view.cluster.status, ClusterStatus::Incomplete);
    // "b" was installed before its start failed.
    assert_eq!(view.cluster.services, set(&["a", "b"]));

    // A later job can repair the cluster.
    cx.executor.clear_faults();
    let start = orchestrator.cluster_start(cluster_id).await.unwrap();
    assert_eq!(cx.wait_for_job(start.id).await.status(), JobStatus::Complete);
    assert_eq!(cx.view(cluster_id).await.cluster.status, ClusterStatus::Active);
    cx.teardown().await;
}
