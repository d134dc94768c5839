// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tasks held by unresponsive workers go back to the queue

use crate::common::is_service_action;
use crate::common::test_config;
use crate::common::TestContext;
use provisioner::executor::Fault;
use provisioner::executor::UnitMatcher;
use provisioner_test_utils::dev::poll::wait_for_condition;
use provisioner_test_utils::dev::poll::CondCheckError;
use provisioner_types::job::JobStatus;
use provisioner_types::service::ProvisionerAction;
use provisioner_types::task::TaskStatus;
use provisioner_types::task::TaskUnit;
use std::time::Duration;

#[tokio::test]
async fn test_expired_lease_is_released_to_another_worker() {
    let mut config = test_config();
    config.scheduler.lease_timeout = Duration::from_millis(200);
    let cx = TestContext::with_config(
        "test_expired_lease_is_released_to_another_worker",
        config,
    );
    cx.executor.inject(
        UnitMatcher::service_action("a", ProvisionerAction::Install),
        Fault::Hold,
    );
    let job = cx.create("leased", 1).await;
    let is_install = |unit: &TaskUnit| {
        is_service_action(unit, "a", ProvisionerAction::Install)
    };
    let first =
        cx.wait_for_task(job.id, TaskStatus::InProgress, is_install).await;
    let task_id = first.id;
    let first_generation = first.lease.unwrap().generation;

    // The held worker never answers, so its lease runs out and someone else
    // gets the task.
    let datastore = cx.datastore.clone();
    let relet = wait_for_condition(
        || {
            let datastore = datastore.clone();
            async move {
                let task = datastore.task_load(task_id).await.unwrap().unwrap();
                let relet = task
                    .lease
                    .as_ref()
                    .is_some_and(|lease| lease.generation > first_generation);
                if relet {
                    Ok(task)
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
    assert_eq!(relet.status, TaskStatus::InProgress);
    // An expired lease isn't a failed attempt.
    assert_eq!(relet.attempts, 0);

    cx.executor.clear_faults();
    cx.executor.release();
    let job = cx.wait_for_job(job.id).await;
    assert_eq!(job.status(), JobStatus::Complete);

    let install = cx.datastore.task_load(task_id).await.unwrap().unwrap();
    assert_eq!(install.status, TaskStatus::Complete);
    assert_eq!(install.attempts, 0);
    assert!(install.lease.is_none());

    let executions = cx
        .executor
        .history()
        .into_iter()
        .filter(|e| is_install(&e.unit))
        .count();
    assert!(executions >= 2, "only {executions} executions");

    let view = cx.view(job.cluster_id).await;
    assert_eq!(view.nodes[0].services.len(), 1);
    cx.teardown().await;
}

#[tokio::test]
async fn test_reaper_reports_through_driver() {
    let cx = TestContext::new("test_reaper_reports_through_driver");
    let driver = cx.provisioner.driver();
    let reaper = &cx.provisioner.background_tasks().lease_reaper;
    assert_eq!(driver.task_period(reaper), Duration::from_millis(50));

    driver.activate(reaper);
    let details = wait_for_condition(
        || {
            let status = driver.task_status(reaper);
            async move {
                match status.last.completion() {
                    Some(last) => Ok(last.details.clone()),
                    None => Err(CondCheckError::<()>::NotYet),
                }
            }
        },
        &Duration::from_millis(10),
        &Duration::from_secs(10),
    )
    .await
    .unwrap();
    assert_eq!(details["reclaimed"], 0);
    assert_eq!(details["queued"], 0);
    assert_eq!(details["leased"], 0);
    cx.teardown().await;
}
