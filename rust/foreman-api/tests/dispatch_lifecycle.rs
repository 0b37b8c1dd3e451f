//! End-to-end dispatch lifecycle over in-memory collaborators: submit,
//! ack, progress, stream, terminal transitions, and their idempotence.

mod common;

use common::{command, harness, WorkerSim, ANCHOR, CHANNEL};
use foreman_api::chat::reaction;
use foreman_api::domain::TaskStatus;
use foreman_protocol::{
    Message, ProgressKind, TaskAck, TaskCancelled, TaskComplete, TaskError, TaskProgress,
    TaskStream,
};

fn ack(task_id: &str) -> Message {
    Message::TaskAck(TaskAck {
        task_id: task_id.into(),
        accepted: true,
        reason: None,
        queue_position: None,
    })
}

fn progress(task_id: &str, message: &str) -> Message {
    Message::TaskProgress(TaskProgress {
        task_id: task_id.into(),
        kind: ProgressKind::ToolUse,
        message: message.into(),
        timestamp: 0,
    })
}

fn complete(task_id: &str) -> Message {
    Message::TaskComplete(TaskComplete {
        task_id: task_id.into(),
        result: "Done.".into(),
        session_id: Some("sess-1".into()),
        input_tokens: 1200,
        output_tokens: 300,
        estimated_cost: 0.015,
        files_changed: vec!["src/auth.ts".into()],
        commands_run: vec!["npm test".into()],
        duration_ms: 4200,
        continuations: None,
        model: "standard-1".into(),
    })
}

#[tokio::test]
async fn test_happy_path_fix_command() {
    let h = harness().await;
    let mut worker = WorkerSim::connect(&h, "w1");

    let task_id = h
        .services
        .commands
        .handle(command("coder", "fix", "fix: null pointer in auth"))
        .await
        .unwrap();

    // worker got the submit, anchor shows in-progress
    let submit = worker.expect_submit();
    assert_eq!(submit.task_id, task_id);
    assert_eq!(submit.local_path, "/srv/demo");
    assert!(h
        .chat
        .reactions(CHANNEL, ANCHOR)
        .contains(&reaction::IN_PROGRESS.to_string()));

    worker.send(&h, ack(&task_id)).await;
    let task = h.services.storage.tasks.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.agent_id.as_deref(), Some("w1"));

    worker.send(&h, progress(&task_id, "Reading auth.ts")).await;
    worker.send(&h, progress(&task_id, "Editing auth.ts")).await;
    worker
        .send(
            &h,
            Message::TaskStream(TaskStream {
                task_id: task_id.clone(),
                delta: "Done.".into(),
                timestamp: 0,
            }),
        )
        .await;
    worker.send(&h, complete(&task_id)).await;

    let task = h.services.storage.tasks.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.usage.input_tokens, 1200);
    assert_eq!(task.usage.output_tokens, 300);
    assert!(task.usage.files_changed.contains("src/auth.ts"));
    assert_eq!(task.session_id.as_deref(), Some("sess-1"));

    // progress message shows both steps and the streamed text
    let texts: Vec<String> = h.chat.messages().iter().map(|m| m.text.clone()).collect();
    assert!(texts.iter().any(|t| t.contains("Reading auth.ts") && t.contains("Editing auth.ts")));
    assert!(texts.iter().any(|t| t.contains("Done.")));

    // reaction flipped to success
    let reactions = h.chat.reactions(CHANNEL, ANCHOR);
    assert!(reactions.contains(&reaction::SUCCESS.to_string()));
    assert!(!reactions.contains(&reaction::IN_PROGRESS.to_string()));
}

#[tokio::test]
async fn test_duplicate_completion_is_a_noop() {
    let h = harness().await;
    let mut worker = WorkerSim::connect(&h, "w1");

    let task_id = h
        .services
        .commands
        .handle(command("coder", "fix", "one-shot"))
        .await
        .unwrap();
    let _ = worker.expect_submit();
    worker.send(&h, ack(&task_id)).await;
    worker.send(&h, complete(&task_id)).await;

    let first = h.services.storage.tasks.get(&task_id).await.unwrap().unwrap();
    worker.send(&h, complete(&task_id)).await;
    let second = h.services.storage.tasks.get(&task_id).await.unwrap().unwrap();

    // one terminal transition; usage not double counted
    assert_eq!(second.usage.input_tokens, first.usage.input_tokens);
    assert_eq!(second.completed_at, first.completed_at);
    assert_eq!(second.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_completion_after_reconnect_is_accepted() {
    let h = harness().await;
    let mut worker = WorkerSim::connect(&h, "w1");

    let task_id = h
        .services
        .commands
        .handle(command("coder", "fix", "survive a freeze"))
        .await
        .unwrap();
    let _ = worker.expect_submit();
    worker.send(&h, ack(&task_id)).await;

    // worker freezes and is swept; the task is not auto-failed
    h.services.registry.sweep_dead(std::time::Duration::ZERO);
    let task = h.services.storage.tasks.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);

    // it reconnects and reports the completion on the new connection
    let reconnected = WorkerSim::connect(&h, "w1");
    reconnected.send(&h, complete(&task_id)).await;
    let task = h.services.storage.tasks.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_worker_error_fails_task_with_reaction() {
    let h = harness().await;
    let mut worker = WorkerSim::connect(&h, "w1");

    let task_id = h
        .services
        .commands
        .handle(command("coder", "fix", "doomed"))
        .await
        .unwrap();
    let _ = worker.expect_submit();
    worker.send(&h, ack(&task_id)).await;
    worker
        .send(
            &h,
            Message::TaskError(TaskError {
                task_id: task_id.clone(),
                error: "compiler exploded".into(),
                recoverable: true,
                session_id: None,
            }),
        )
        .await;

    let task = h.services.storage.tasks.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let reactions = h.chat.reactions(CHANNEL, ANCHOR);
    assert!(reactions.contains(&reaction::FAILURE.to_string()));
    // the error block offers a resubmit affordance for recoverable errors
    let texts: Vec<String> = h.chat.messages().iter().map(|m| m.text.clone()).collect();
    assert!(texts.iter().any(|t| t.contains("resubmit_task")));
}

#[tokio::test]
async fn test_cancel_is_idempotent_across_local_and_worker_paths() {
    let h = harness().await;
    let mut worker = WorkerSim::connect(&h, "w1");

    let task_id = h
        .services
        .commands
        .handle(command("coder", "fix", "cancel me"))
        .await
        .unwrap();
    let _ = worker.expect_submit();
    worker.send(&h, ack(&task_id)).await;

    h.services.commands.cancel(&task_id, "user asked").await.unwrap();
    let task = h.services.storage.tasks.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    let cancelled_at = task.completed_at;

    // the worker's confirmation afterwards does not change anything
    worker
        .send(
            &h,
            Message::TaskCancelled(TaskCancelled {
                task_id: task_id.clone(),
                reason: "user asked".into(),
            }),
        )
        .await;
    let task = h.services.storage.tasks.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.completed_at, cancelled_at);

    // worker was told to cancel via broadcast
    let cancels = worker
        .drain()
        .into_iter()
        .filter(|m| matches!(m, Message::TaskCancel(_)))
        .count();
    assert_eq!(cancels, 1);
}

#[tokio::test]
async fn test_rejected_ack_fails_the_task_as_recoverable() {
    let h = harness().await;
    let mut worker = WorkerSim::connect(&h, "w1");

    let task_id = h
        .services
        .commands
        .handle(command("coder", "fix", "no room"))
        .await
        .unwrap();
    let _ = worker.expect_submit();
    worker
        .send(
            &h,
            Message::TaskAck(TaskAck {
                task_id: task_id.clone(),
                accepted: false,
                reason: Some("resources exhausted".into()),
                queue_position: None,
            }),
        )
        .await;

    let task = h.services.storage.tasks.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_unknown_task_events_are_dropped() {
    let h = harness().await;
    let worker = WorkerSim::connect(&h, "w1");
    // nothing submitted; these must not panic or create rows
    worker.send(&h, ack("ghost")).await;
    worker.send(&h, complete("ghost")).await;
    assert!(h.services.storage.tasks.get("ghost").await.unwrap().is_none());
}
