// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tasks run in dependency order

use crate::common::is_service_action;
use crate::common::set;
use crate::common::TestContext;
use provisioner::executor::Execution;
use provisioner_types::service::ProvisionerAction;
use provisioner_types::task::TaskUnit;

fn execution<'a>(
    history: &'a [Execution],
    service: &str,
    action: ProvisionerAction,
) -> &'a Execution {
    let matching: Vec<&Execution> = history
        .iter()
        .filter(|e| is_service_action(&e.unit, service, action))
        .collect();
    assert_eq!(matching.len(), 1, "executions of {service} {action:?}");
    matching[0]
}

#[tokio::test]
async fn test_live_dependency_orders_install_after_start() {
    let cx = TestContext::new("test_live_dependency_orders_install_after_start");
    let view = cx.create_and_wait("ordered", 1).await;
    assert_eq!(view.cluster.services, set(&["a", "b"]));

    let history = cx.executor.history();
    let a_start = execution(&history, "a", ProvisionerAction::Start);
    let b_install = execution(&history, "b", ProvisionerAction::Install);
    assert!(
        b_install.started > a_start.finished,
        "b installed before a was running: {history:#?}"
    );

    // Every service action on a node waits for the node itself.
    for node in &view.nodes {
        let create = history
            .iter()
            .find(|e| e.unit == TaskUnit::node(node.id, ProvisionerAction::Create))
            .unwrap();
        for e in history.iter().filter(|e| {
            e.unit.node_id == node.id && e.unit.service.is_some()
        }) {
            assert!(e.started > create.finished, "{e:?} ran before {create:?}");
        }
    }
    cx.teardown().await;
}

#[tokio::test]
async fn test_recorded_predecessors_match_execution_order() {
    let cx =
        TestContext::new("test_recorded_predecessors_match_execution_order");
    let view = cx.create_and_wait("coordinated", 3).await;
    let history = cx.executor.history();
    let by_unit = |unit: &TaskUnit| {
        let found: Vec<&Execution> =
            history.iter().filter(|e| &e.unit == unit).collect();
        assert_eq!(found.len(), 1, "{unit}");
        found[0]
    };

    assert_eq!(history.len(), view.tasks.len());
    for task in &view.tasks {
        let this = by_unit(&task.unit);
        for predecessor in &task.predecessors {
            let before = view.tasks.iter().find(|t| t.id == *predecessor).unwrap();
            let before = by_unit(&before.unit);
            assert!(
                this.started > before.finished,
                "{} started before {} finished",
                this.unit,
                before.unit
            );
        }
    }

    // "worker" has a runtime dependency on "coordinator": no worker starts
    // until the coordinator has.
    let coordinator = &view.nodes[0];
    let coordinator_start = by_unit(&TaskUnit::service(
        coordinator.id,
        "coordinator",
        ProvisionerAction::Start,
    ));
    for node in &view.nodes[1..] {
        let worker_start = by_unit(&TaskUnit::service(
            node.id,
            "worker",
            ProvisionerAction::Start,
        ));
        assert!(worker_start.started > coordinator_start.finished);
    }
    cx.teardown().await;
}
