// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating clusters and changing their size and services

use crate::common::is_service_action;
use crate::common::node_services;
use crate::common::set;
use crate::common::TestContext;
use crate::common::OWNER;
use assert_matches::assert_matches;
use provisioner::app::ClusterCreateParams;
use provisioner::app::NodePropertiesRequest;
use provisioner::executor::Fault;
use provisioner::executor::UnitMatcher;
use provisioner_common::api::Error;
use provisioner_types::cluster::ClusterStatus;
use provisioner_types::job::JobStatus;
use provisioner_types::service::ProvisionerAction;
use provisioner_types::task::TaskStatus;
use std::collections::BTreeSet;

#[tokio::test]
async fn test_create_places_coordinator_and_workers() {
    let cx = TestContext::new("test_create_places_coordinator_and_workers");
    let view = cx.create_and_wait("coordinated", 3).await;

    assert_eq!(view.cluster.status, ClusterStatus::Active);
    assert_eq!(view.cluster.active_job, None);
    assert_eq!(view.cluster.node_count, 3);
    assert_eq!(view.cluster.services, set(&["agent", "coordinator", "worker"]));
    assert_eq!(
        node_services(&view),
        vec![
            set(&["coordinator"]),
            set(&["agent", "worker"]),
            set(&["agent", "worker"]),
        ]
    );
    assert_eq!(
        view.cluster.nodes,
        view.nodes.iter().map(|n| n.id).collect::<BTreeSet<_>>()
    );

    // Every node got an address from the agent that created it.
    for node in &view.nodes {
        let hostname = node.properties.hostname.as_deref().unwrap();
        assert!(hostname.ends_with(".sim"), "{hostname}");
        assert!(node.properties.ip_addresses.contains_key("access_v4"));
    }

    let report = view.report.unwrap();
    assert_eq!(report.succeeded.len(), view.tasks.len());
    assert!(report.failed.is_empty());
    assert!(report.skipped.is_empty());
    assert!(report.pending.is_empty());
    assert!(view.tasks.iter().all(|t| t.status == TaskStatus::Complete));
    cx.teardown().await;
}

#[tokio::test]
async fn test_create_rejects_unsatisfiable_requests() {
    let cx = TestContext::new("test_create_rejects_unsatisfiable_requests");
    let orchestrator = cx.orchestrator();
    let params = |template: &str, node_count| ClusterCreateParams {
        name: "bad".to_string(),
        owner: OWNER.to_string(),
        template: template.to_string(),
        node_count,
        services: None,
        hardware_type: None,
        image_type: None,
    };

    // One coordinator and at most three workers fill at most four nodes.
    assert_matches!(
        orchestrator.cluster_create(params("coordinated", 5)).await,
        Err(Error::ConstraintUnsatisfiable { .. })
    );
    assert_matches!(
        orchestrator.cluster_create(params("no-such-template", 1)).await,
        Err(Error::ObjectNotFound { .. })
    );
    // "b" can't run without "a".
    assert_matches!(
        orchestrator
            .cluster_create(ClusterCreateParams {
                services: Some(set(&["b"])),
                ..params("ordered", 1)
            })
            .await,
        Err(Error::ConstraintUnsatisfiable { .. })
    );

    // Nothing was written.
    assert!(cx.datastore.cluster_list().await.unwrap().is_empty());
    assert_eq!(orchestrator.running_jobs(), 0);
    cx.teardown().await;
}

#[tokio::test]
async fn test_one_job_per_cluster() {
    let cx = TestContext::new("test_one_job_per_cluster");
    cx.executor.inject(
        UnitMatcher::service_action("agent", ProvisionerAction::Start),
        Fault::Hold,
    );
    let job = cx.create("coordinated", 2).await;
    cx.wait_for_task(job.id, TaskStatus::InProgress, |unit| {
        is_service_action(unit, "agent", ProvisionerAction::Start)
    })
    .await;

    let orchestrator = cx.orchestrator();
    assert_matches!(
        orchestrator.cluster_stop(job.cluster_id).await,
        Err(Error::Conflict { .. })
    );
    assert_matches!(
        orchestrator.cluster_resize(job.cluster_id, 3).await,
        Err(Error::Conflict { .. })
    );

    cx.executor.release();
    let job = cx.wait_for_job(job.id).await;
    assert_eq!(job.status(), JobStatus::Complete);

    // Once the job is done the cluster takes new work.
    let stop = orchestrator.cluster_stop(job.cluster_id).await.unwrap();
    assert_eq!(cx.wait_for_job(stop.id).await.status(), JobStatus::Complete);
    cx.teardown().await;
}

#[tokio::test]
async fn test_resize() {
    let cx = TestContext::new("test_resize");
    let view = cx.create_and_wait("coordinated", 3).await;
    let cluster_id = view.cluster.id;
    let original: Vec<_> = view.nodes.iter().map(|n| n.id).collect();

    let grow = cx.orchestrator().cluster_resize(cluster_id, 4).await.unwrap();
    assert_eq!(cx.wait_for_job(grow.id).await.status(), JobStatus::Complete);
    let view = cx.view(cluster_id).await;
    assert_eq!(view.cluster.status, ClusterStatus::Active);
    assert_eq!(view.cluster.node_count, 4);
    assert_eq!(view.nodes.len(), 4);
    assert_eq!(view.nodes[3].services, set(&["agent", "worker"]));
    assert_eq!(view.nodes[3].ordinal, 3);
    // Existing nodes were left alone: every task of the job targets the new
    // node.
    assert!(view.tasks.iter().all(|t| t.unit.node_id == view.nodes[3].id));

    let shrink = cx.orchestrator().cluster_resize(cluster_id, 2).await.unwrap();
    assert_eq!(cx.wait_for_job(shrink.id).await.status(), JobStatus::Complete);
    let view = cx.view(cluster_id).await;
    assert_eq!(view.cluster.node_count, 2);
    assert_eq!(
        node_services(&view),
        vec![set(&["coordinator"]), set(&["agent", "worker"])]
    );
    assert_eq!(
        view.nodes.iter().map(|n| n.id).collect::<Vec<_>>(),
        original[..2].to_vec()
    );
    assert_eq!(view.cluster.nodes.len(), 2);

    // Shrinking below what the template requires is refused up front.
    assert_matches!(
        cx.orchestrator().cluster_resize(cluster_id, 0).await,
        Err(Error::ConstraintUnsatisfiable { .. })
    );
    assert_eq!(cx.view(cluster_id).await.cluster.latest_job, Some(shrink.id));
    cx.teardown().await;
}

#[tokio::test]
async fn test_add_and_remove_services() {
    let cx = TestContext::new("test_add_and_remove_services");
    let view = cx.create_and_wait("coordinated", 3).await;
    let cluster_id = view.cluster.id;
    let orchestrator = cx.orchestrator();

    let remove = orchestrator
        .cluster_remove_services(cluster_id, set(&["agent"]))
        .await
        .unwrap();
    assert_eq!(cx.wait_for_job(remove.id).await.status(), JobStatus::Complete);
    let view = cx.view(cluster_id).await;
    assert_eq!(view.cluster.services, set(&["coordinator", "worker"]));
    assert_eq!(
        node_services(&view),
        vec![set(&["coordinator"]), set(&["worker"]), set(&["worker"])]
    );
    let actions: BTreeSet<_> = view.tasks.iter().map(|t| t.unit.action).collect();
    assert_eq!(
        actions,
        BTreeSet::from([ProvisionerAction::Stop, ProvisionerAction::Remove])
    );

    let add = orchestrator
        .cluster_add_services(cluster_id, set(&["agent"]))
        .await
        .unwrap();
    assert_eq!(cx.wait_for_job(add.id).await.status(), JobStatus::Complete);
    let view = cx.view(cluster_id).await;
    assert_eq!(view.cluster.services, set(&["agent", "coordinator", "worker"]));
    // "agent" always runs alongside "worker".
    assert_eq!(
        node_services(&view),
        vec![
            set(&["coordinator"]),
            set(&["agent", "worker"]),
            set(&["agent", "worker"]),
        ]
    );

    assert_matches!(
        orchestrator.cluster_add_services(cluster_id, BTreeSet::new()).await,
        Err(Error::InvalidRequest { .. })
    );
    assert_matches!(
        orchestrator.cluster_remove_services(cluster_id, set(&["zzz"])).await,
        Err(Error::InvalidRequest { .. })
    );
    assert_matches!(
        orchestrator
            .cluster_remove_services(
                cluster_id,
                set(&["agent", "coordinator", "worker"])
            )
            .await,
        Err(Error::InvalidRequest { .. })
    );
    // "worker" needs "coordinator".
    assert_matches!(
        orchestrator
            .cluster_remove_services(cluster_id, set(&["coordinator"]))
            .await,
        Err(Error::ConstraintUnsatisfiable { .. })
    );
    assert_matches!(
        orchestrator.cluster_add_services(cluster_id, set(&["a"])).await,
        Err(Error::ConstraintUnsatisfiable { .. })
    );
    cx.teardown().await;
}

#[tokio::test]
async fn test_node_properties() {
    let cx = TestContext::new("test_node_properties");
    let view = cx.create_and_wait("coordinated", 3).await;
    let orchestrator = cx.orchestrator();

    let request = NodePropertiesRequest {
        cluster_id: view.cluster.id,
        services: BTreeSet::new(),
        properties: BTreeSet::new(),
    };
    let all = orchestrator.cluster_node_properties(OWNER, &request).await.unwrap();
    assert_eq!(all.len(), 3);

    let coordinator = &view.nodes[0];
    let filtered = orchestrator
        .cluster_node_properties(
            OWNER,
            &NodePropertiesRequest {
                services: set(&["coordinator"]),
                properties: set(&["hostname"]),
                ..request.clone()
            },
        )
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    let properties = &filtered[&coordinator.id];
    assert_eq!(properties.len(), 1);
    assert_eq!(
        properties["hostname"],
        serde_json::json!(coordinator.properties.hostname)
    );

    // Other people's clusters look empty.
    let theirs = orchestrator
        .cluster_node_properties("someone-else", &request)
        .await
        .unwrap();
    assert!(theirs.is_empty());
    cx.teardown().await;
}
