//! Scheduler behavior: validation, due-row submission, recurrence.

mod common;

use chrono::{Duration, Utc};
use common::{harness, WorkerSim};
use foreman_api::domain::{Recurrence, Schedule, ScheduleStatus};
use foreman_api::scheduler::{ScheduleDraft, ScheduleError};

fn draft(recurrence: Recurrence) -> ScheduleDraft {
    ScheduleDraft {
        project_id: "p1".into(),
        bot_name: "coder".into(),
        command: "review".into(),
        prompt: "nightly review of open PRs".into(),
        user_id: "U-dev".into(),
        recurrence,
    }
}

#[tokio::test]
async fn test_one_shot_must_be_in_the_future() {
    let h = harness().await;
    let err = h
        .services
        .scheduler
        .create(draft(Recurrence::Once {
            run_at: Utc::now() - Duration::minutes(5),
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::InThePast));
}

#[tokio::test]
async fn test_recurring_frequency_is_bounded() {
    let h = harness().await;

    let err = h
        .services
        .scheduler
        .create(draft(Recurrence::Cron {
            expression: "*/5 * * * *".into(),
            timezone: "UTC".into(),
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::TooFrequent));

    // hourly is the minimum allowed
    let id = h
        .services
        .scheduler
        .create(draft(Recurrence::Cron {
            expression: "0 * * * *".into(),
            timezone: "America/New_York".into(),
        }))
        .await
        .unwrap();
    let schedule = h.services.storage.schedules.get(&id).await.unwrap().unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Active);
    assert!(schedule.next_run_at.unwrap() > Utc::now());
}

#[tokio::test]
async fn test_unknown_timezone_and_bad_cron_rejected() {
    let h = harness().await;
    assert!(matches!(
        h.services
            .scheduler
            .create(draft(Recurrence::Cron {
                expression: "0 9 * * *".into(),
                timezone: "Mars/Olympus_Mons".into(),
            }))
            .await
            .unwrap_err(),
        ScheduleError::InvalidTimezone(_)
    ));
    assert!(matches!(
        h.services
            .scheduler
            .create(draft(Recurrence::Cron {
                expression: "not cron".into(),
                timezone: "UTC".into(),
            }))
            .await
            .unwrap_err(),
        ScheduleError::InvalidCron(_)
    ));
}

#[tokio::test]
async fn test_due_one_shot_submits_and_completes() {
    let h = harness().await;
    let mut worker = WorkerSim::connect(&h, "w1");

    // seed a past-due one-shot directly; `create` refuses past times
    let schedule = Schedule {
        id: "sched-1".into(),
        project_id: "p1".into(),
        bot_name: "coder".into(),
        command: "review".into(),
        prompt: "overdue review".into(),
        user_id: "U-dev".into(),
        recurrence: Recurrence::Once {
            run_at: Utc::now() - Duration::minutes(2),
        },
        next_run_at: Some(Utc::now() - Duration::minutes(2)),
        enabled: true,
        status: ScheduleStatus::Active,
        created_at: Utc::now() - Duration::hours(1),
        last_run_at: None,
    };
    h.services.storage.schedules.create(&schedule).await.unwrap();

    h.services.scheduler.tick().await;

    // the scheduled command became a dispatched task
    let submit = worker.expect_submit();
    assert_eq!(submit.command, "review");
    assert!(submit.prompt.contains("overdue review"));

    let schedule = h
        .services
        .storage
        .schedules
        .get("sched-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Completed);
    assert!(schedule.next_run_at.is_none());
    assert!(schedule.last_run_at.is_some());

    // a second tick does nothing
    h.services.scheduler.tick().await;
    assert!(worker
        .drain()
        .into_iter()
        .all(|m| !matches!(m, foreman_protocol::Message::TaskSubmit(_))));
}

#[tokio::test]
async fn test_due_recurring_advances_next_run() {
    let h = harness().await;
    let _worker = WorkerSim::connect(&h, "w1");

    let schedule = Schedule {
        id: "sched-2".into(),
        project_id: "p1".into(),
        bot_name: "coder".into(),
        command: "review".into(),
        prompt: "hourly sweep".into(),
        user_id: "U-dev".into(),
        recurrence: Recurrence::Cron {
            expression: "0 * * * *".into(),
            timezone: "UTC".into(),
        },
        next_run_at: Some(Utc::now() - Duration::minutes(1)),
        enabled: true,
        status: ScheduleStatus::Active,
        created_at: Utc::now() - Duration::hours(2),
        last_run_at: None,
    };
    h.services.storage.schedules.create(&schedule).await.unwrap();

    h.services.scheduler.tick().await;

    let schedule = h
        .services
        .storage
        .schedules
        .get("sched-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Active);
    let next = schedule.next_run_at.unwrap();
    assert!(next > Utc::now());
    assert!(next <= Utc::now() + Duration::hours(1) + Duration::minutes(1));
}
