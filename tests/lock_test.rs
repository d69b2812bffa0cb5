//! Lock set behaviour seen from the worker pool.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use vpc_topology::lock::{LockManager, LockTarget};
use vpc_topology::models::{AddAvailabilityZoneTaskData, Task, TaskConfig, TaskStatus};
use vpc_topology::tasks::{perform_task, StopSignal, TaskOutcome, WorkerPool};
use vpc_topology::testmocks::{IpamCall, RecordingIpamClient};

fn add_az_task(id: u64, letter: &str) -> Arc<Task> {
    Arc::new(Task::new(
        id,
        TaskConfig::AddAvailabilityZone(AddAvailabilityZoneTaskData {
            vpc_id: VPC_ID.to_string(),
            region: REGION.to_string(),
            az_name: az_name(letter),
        }),
    ))
}

fn with_slow_ipam(w: World, delay: Duration) -> World {
    World {
        ipam: Arc::new(RecordingIpamClient::new(w.ipam.tree()).with_delay(delay)),
        ..w
    }
}

async fn wait_for(task: &Task, status: TaskStatus) {
    for _ in 0..200 {
        if task.status() == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task {} stuck in {}", task.id, task.status());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ipam_writers_do_not_interleave() {
    let w = with_slow_ipam(scenario_a(), Duration::from_millis(50));
    let pool = WorkerPool::start(w.env(), 2);
    let c = add_az_task(1, "c");
    let d = add_az_task(2, "d");
    pool.submit(c.clone()).unwrap();
    pool.submit(d.clone()).unwrap();
    pool.shutdown().await;

    assert_eq!(c.status(), TaskStatus::Successful);
    assert_eq!(d.status(), TaskStatus::Successful);
    // Each task loads once and saves after its CIDR and each subnet; the
    // second load only happens after the first task's last save.
    let one_task = [IpamCall::Load, IpamCall::Save, IpamCall::Save, IpamCall::Save];
    assert_eq!(w.ipam.calls(), [one_task, one_task].concat());
    let vpc = w.vpc();
    assert!(vpc.state.availability_zones.contains_key("us-east-1c"));
    assert!(vpc.state.availability_zones.contains_key("us-east-1d"));
    w.ipam.tree().verify_tiling().unwrap();
}

#[tokio::test]
async fn test_lock_timeout_requeues_without_side_effects() {
    let mut w = scenario_a();
    w.config.lock_timeout = Duration::from_millis(50);
    let held = w
        .locks
        .acquire(&[LockTarget::Vpc(VPC_ID.to_string())], Duration::from_secs(1))
        .await
        .unwrap();

    let task = add_az_task(1, "c");
    let outcome = perform_task(&w.env(), &task, &StopSignal::never()).await;
    assert_eq!(outcome, TaskOutcome::Requeue);
    assert_eq!(task.status(), TaskStatus::Queued);
    assert!(task.messages().is_empty());
    assert!(w.ipam.calls().is_empty());
    assert_eq!(w.network.calls().len(), 0);

    drop(held);
    let outcome = perform_task(&w.env(), &task, &StopSignal::never()).await;
    assert_eq!(outcome, TaskOutcome::Finished(TaskStatus::Successful));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_retries_until_lock_is_free() {
    let mut w = scenario_a();
    w.config.lock_timeout = Duration::from_millis(50);
    let held = w
        .locks
        .acquire(&[LockTarget::IpamWrite], Duration::from_secs(1))
        .await
        .unwrap();

    let pool = WorkerPool::start(w.env(), 1);
    let task = add_az_task(1, "c");
    pool.submit(task.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(task.status(), TaskStatus::Queued);

    drop(held);
    wait_for(&task, TaskStatus::Successful).await;
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_cancels_running_task_and_keeps_queue() {
    let w = with_slow_ipam(scenario_a(), Duration::from_millis(400));
    let pool = WorkerPool::start(w.env(), 1);
    let running = add_az_task(1, "c");
    let waiting = add_az_task(2, "d");
    pool.submit(running.clone()).unwrap();
    pool.submit(waiting.clone()).unwrap();
    wait_for(&running, TaskStatus::InProgress).await;

    pool.stop().await;

    assert_eq!(running.status(), TaskStatus::Failed);
    assert!(running
        .messages()
        .iter()
        .any(|m| m.starts_with("Error: ") && m.contains("cancelled")));
    assert_eq!(waiting.status(), TaskStatus::Queued);
    assert_eq!(w.ipam.calls(), vec![IpamCall::Load]);
    assert_eq!(w.network.mutation_count(), 0);
}
