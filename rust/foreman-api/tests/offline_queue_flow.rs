//! Offline submission and drain-on-reconnect (at-least-once delivery).

mod common;

use common::{command, harness, WorkerSim, ANCHOR, CHANNEL};
use foreman_api::chat::reaction;
use foreman_api::domain::TaskStatus;
use foreman_protocol::{Message, TaskAck};

#[tokio::test]
async fn test_offline_submit_queues_then_drains_on_reconnect() {
    let h = harness().await;

    // no workers online: the task parks in the offline queue
    let task_id = h
        .services
        .commands
        .handle(command("coder", "fix", "review pr #42"))
        .await
        .unwrap();

    let task = h.services.storage.tasks.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert!(h
        .chat
        .reactions(CHANNEL, ANCHOR)
        .contains(&reaction::QUEUED.to_string()));

    // a worker connects later; one drain cycle delivers the submit
    let mut worker = WorkerSim::connect(&h, "w1");
    let summary = h.services.queue.drain_all().await;
    assert_eq!(summary.delivered, 1);

    let submit = worker.expect_submit();
    assert_eq!(submit.task_id, task_id);

    // delivery flipped the task to pending and the reaction follows
    let task = h.services.storage.tasks.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    let reactions = h.chat.reactions(CHANNEL, ANCHOR);
    assert!(reactions.contains(&reaction::IN_PROGRESS.to_string()));
    assert!(!reactions.contains(&reaction::QUEUED.to_string()));

    // ack completes the handoff
    worker
        .send(
            &h,
            Message::TaskAck(TaskAck {
                task_id: task_id.clone(),
                accepted: true,
                reason: None,
                queue_position: None,
            }),
        )
        .await;
    let task = h.services.storage.tasks.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);
}

#[tokio::test]
async fn test_second_drain_does_not_redeliver() {
    let h = harness().await;
    let task_id = h
        .services
        .commands
        .handle(command("coder", "fix", "only once"))
        .await
        .unwrap();

    let mut worker = WorkerSim::connect(&h, "w1");
    assert_eq!(h.services.queue.drain_all().await.delivered, 1);
    let _ = worker.expect_submit();

    assert_eq!(h.services.queue.drain_all().await.delivered, 0);
    let submits = worker
        .drain()
        .into_iter()
        .filter(|m| matches!(m, Message::TaskSubmit(_)))
        .count();
    assert_eq!(submits, 0, "delivered entries are never resent");

    let task = h.services.storage.tasks.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_drain_delivers_to_fallback_worker() {
    let h = harness().await;
    // project prefers w1, but only w9 comes online
    let task_id = h
        .services
        .commands
        .handle(command("coder", "fix", "anyone will do"))
        .await
        .unwrap();

    let mut other = WorkerSim::connect(&h, "w9");
    assert_eq!(h.services.queue.drain_all().await.delivered, 1);
    assert_eq!(other.expect_submit().task_id, task_id);
}
