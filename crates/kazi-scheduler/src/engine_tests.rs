use super::*;
use chrono::Duration;
use std::time::Duration as StdDuration;
use tokio::time::sleep;

async fn engine() -> ScheduleEngine {
    let db = Database::in_memory().await.unwrap();
    ScheduleEngine::new(db)
}

fn interval(minutes: u32) -> ScheduleKind {
    ScheduleKind::Interval { minutes }
}

#[tokio::test]
async fn test_create_computes_initial_next_run() {
    let engine = engine().await;
    let start = Utc::now() + Duration::hours(2);

    let schedule = engine
        .create(NewSchedule::new("reports", interval(30)).with_start_time(start))
        .await
        .unwrap();

    assert!(schedule.is_active);
    assert_eq!(schedule.run_count, 0);
    assert_eq!(schedule.next_run_at, Some(start));

    let stored = engine.get(schedule.id).await.unwrap();
    assert_eq!(stored.kind, interval(30));
    assert_eq!(stored.next_run_at, Some(start));
}

#[tokio::test]
async fn test_create_validation_rejects_before_write() {
    let engine = engine().await;

    let err = engine
        .create(NewSchedule::new("", interval(30)))
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::Validation(_)));

    let err = engine
        .create(NewSchedule::new("bad-interval", interval(0)))
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::Validation(_)));

    let err = engine
        .create(NewSchedule::new(
            "bad-cron",
            ScheduleKind::Cron {
                expression: "not a cron".to_string(),
                days_of_week: None,
            },
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::Cron(_)));

    let err = engine
        .create(NewSchedule::new(
            "bad-days",
            ScheduleKind::Cron {
                expression: "0 0 9 * * *".to_string(),
                days_of_week: Some(vec![9]),
            },
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::Validation(_)));

    let err = engine
        .create(NewSchedule::new("bad-tz", interval(5)).with_timezone("Mars/Olympus_Mons"))
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::Validation(_)));

    let now = Utc::now();
    let err = engine
        .create(
            NewSchedule::new("bad-window", interval(5))
                .with_start_time(now)
                .with_end_time(now - Duration::hours(1)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::Validation(_)));

    assert!(engine.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cron_kind_round_trips_through_store() {
    let engine = engine().await;
    let kind = ScheduleKind::Cron {
        expression: "0 0 9 * * *".to_string(),
        days_of_week: Some(vec![1, 3, 5]),
    };

    let schedule = engine
        .create(
            NewSchedule::new("weekday-digest", kind.clone())
                .with_timezone("America/New_York")
                .with_target("report", "generate")
                .with_entity_id("digest-1")
                .with_action_config(serde_json::json!({"format": "pdf"})),
        )
        .await
        .unwrap();

    let stored = engine.get(schedule.id).await.unwrap();
    assert_eq!(stored.kind, kind);
    assert_eq!(stored.timezone, "America/New_York");
    assert_eq!(stored.entity_type, "report");
    assert_eq!(stored.entity_id.as_deref(), Some("digest-1"));
    assert_eq!(stored.action, "generate");
    assert_eq!(stored.action_config, serde_json::json!({"format": "pdf"}));
}

#[tokio::test]
async fn test_due_returns_ripe_schedules_in_order() {
    let engine = engine().await;
    let soon = Utc::now() + Duration::milliseconds(200);
    let later = Utc::now() + Duration::milliseconds(300);

    let second = engine
        .create(NewSchedule::new("later", interval(5)).with_start_time(later))
        .await
        .unwrap();
    let first = engine
        .create(NewSchedule::new("soon", interval(5)).with_start_time(soon))
        .await
        .unwrap();
    engine
        .create(NewSchedule::new("far", interval(5)).with_start_time(Utc::now() + Duration::hours(1)))
        .await
        .unwrap();

    assert!(engine.due().await.unwrap().is_empty());

    sleep(StdDuration::from_millis(400)).await;
    let due = engine.due().await.unwrap();
    assert_eq!(due.len(), 2);
    assert_eq!(due[0].id, first.id);
    assert_eq!(due[1].id, second.id);
}

#[tokio::test]
async fn test_record_run_advances_next_run_monotonically() {
    let engine = engine().await;
    let schedule = engine
        .create(
            NewSchedule::new("half-hourly", interval(30))
                .with_start_time(Utc::now() - Duration::hours(1)),
        )
        .await
        .unwrap();

    let after_first = engine
        .record_run(schedule.id, RunOutcome::success(125))
        .await
        .unwrap();

    assert_eq!(after_first.run_count, 1);
    assert_eq!(after_first.last_status, Some(RunStatus::Success));
    let first_run_at = after_first.last_run_at.unwrap();
    let first_next = after_first.next_run_at.unwrap();
    assert!(first_next >= first_run_at + Duration::minutes(30));

    let after_second = engine
        .record_run(schedule.id, RunOutcome::failure(42, "exporter crashed"))
        .await
        .unwrap();

    assert_eq!(after_second.run_count, 2);
    assert_eq!(after_second.last_status, Some(RunStatus::Failed));
    let second_next = after_second.next_run_at.unwrap();
    assert!(second_next >= first_next);
    assert!(second_next >= after_second.last_run_at.unwrap() + Duration::minutes(30));
}

#[tokio::test]
async fn test_record_run_appends_audit_rows() {
    let engine = engine().await;
    let schedule = engine
        .create(NewSchedule::new("audited", interval(5)))
        .await
        .unwrap();

    engine
        .record_run(
            schedule.id,
            RunOutcome::success(10).with_output(serde_json::json!({"rows": 4})),
        )
        .await
        .unwrap();
    engine
        .record_run(schedule.id, RunOutcome::failure(99, "boom"))
        .await
        .unwrap();
    engine
        .record_run(schedule.id, RunOutcome::skipped())
        .await
        .unwrap();

    let runs = engine.runs(schedule.id, None).await.unwrap();
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|run| run.schedule_id == schedule.id));

    let statuses: Vec<RunStatus> = runs.iter().map(|run| run.status).collect();
    assert!(statuses.contains(&RunStatus::Success));
    assert!(statuses.contains(&RunStatus::Failed));
    assert!(statuses.contains(&RunStatus::Skipped));

    let success = runs
        .iter()
        .find(|run| run.status == RunStatus::Success)
        .unwrap();
    assert_eq!(success.duration_ms, Some(10));
    assert_eq!(success.output, Some(serde_json::json!({"rows": 4})));

    let limited = engine.runs(schedule.id, Some(2)).await.unwrap();
    assert_eq!(limited.len(), 2);
}

#[tokio::test]
async fn test_one_shot_exhausts_after_recorded_run() {
    let engine = engine().await;
    let start = Utc::now() + Duration::milliseconds(100);
    let schedule = engine
        .create(NewSchedule::new("once", ScheduleKind::OneShot).with_start_time(start))
        .await
        .unwrap();
    assert_eq!(schedule.next_run_at, Some(start));

    sleep(StdDuration::from_millis(150)).await;
    let due = engine.due().await.unwrap();
    assert_eq!(due.len(), 1);

    let fired = engine
        .record_run(schedule.id, RunOutcome::success(5))
        .await
        .unwrap();
    assert_eq!(fired.next_run_at, None);
    assert!(fired.is_active);

    assert!(engine.due().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_end_time_exhausts_at_create() {
    let engine = engine().await;
    let now = Utc::now();

    // First interval tick would land past the end of the window.
    let schedule = engine
        .create(
            NewSchedule::new("short-lived", interval(60))
                .with_start_time(now - Duration::hours(3))
                .with_end_time(now + Duration::minutes(5)),
        )
        .await
        .unwrap();

    assert_eq!(schedule.next_run_at, None);
    assert!(engine.due().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deactivate_preserves_next_run() {
    let engine = engine().await;
    let soon = Utc::now() + Duration::milliseconds(100);
    let schedule = engine
        .create(NewSchedule::new("toggled", interval(5)).with_start_time(soon))
        .await
        .unwrap();

    let deactivated = engine.deactivate(schedule.id).await.unwrap();
    assert!(!deactivated.is_active);
    assert_eq!(deactivated.next_run_at, Some(soon));

    sleep(StdDuration::from_millis(150)).await;
    assert!(engine.due().await.unwrap().is_empty());

    let reactivated = engine.activate(schedule.id).await.unwrap();
    assert!(reactivated.is_active);
    assert_eq!(reactivated.next_run_at, Some(soon));
    assert_eq!(engine.due().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_schedule_errors() {
    let engine = engine().await;
    let missing = Uuid::new_v4();

    assert!(matches!(
        engine.get(missing).await.unwrap_err(),
        ScheduleError::NotFound(_)
    ));
    assert!(matches!(
        engine.record_run(missing, RunOutcome::success(1)).await.unwrap_err(),
        ScheduleError::NotFound(_)
    ));
    assert!(matches!(
        engine.deactivate(missing).await.unwrap_err(),
        ScheduleError::NotFound(_)
    ));
}

mod integration {
    //! A due schedule firing into the job queue and a worker pool
    //! draining it, the way an application executor wires the two
    //! engines together.

    use super::*;
    use async_trait::async_trait;
    use kazi_queue::{
        Job, JobHandler, JobRegistry, NewJob, QueueConfig, QueueEngine, RetryBackoff, Worker,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingHandler {
        runs: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn run(&self, _job: &Job) -> anyhow::Result<serde_json::Value> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn test_due_schedule_enqueues_job_and_worker_drains_it() {
        let db = Database::in_memory().await.unwrap();
        let schedules = ScheduleEngine::new(db.clone());
        let queue = QueueEngine::with_config(
            db,
            QueueConfig {
                backoff: RetryBackoff::None,
                poll_interval_ms: 10,
                jitter_ms: 0,
                ..QueueConfig::default()
            },
        );

        let schedule = schedules
            .create(
                NewSchedule::new("hourly-export", interval(60))
                    .with_start_time(Utc::now() + Duration::milliseconds(100))
                    .with_action_config(serde_json::json!({
                        "queue_name": "exports",
                        "job_type": "generate_export",
                        "payload": {"format": "csv"}
                    })),
            )
            .await
            .unwrap();

        sleep(StdDuration::from_millis(150)).await;

        // The executor loop: poll due schedules, enqueue the bound job,
        // record the firing.
        for due in schedules.due().await.unwrap() {
            let config = &due.action_config;
            let job = queue
                .enqueue(NewJob::new(
                    config["queue_name"].as_str().unwrap(),
                    config["job_type"].as_str().unwrap(),
                    config["payload"].clone(),
                ))
                .await
                .unwrap();
            schedules
                .record_run(
                    due.id,
                    RunOutcome::success(1).with_output(serde_json::json!({"job_id": job.id})),
                )
                .await
                .unwrap();
        }

        let runs = Arc::new(AtomicU32::new(0));
        let registry = Arc::new(JobRegistry::new().register(
            "generate_export",
            Arc::new(CountingHandler { runs: runs.clone() }),
        ));
        Worker::new(queue.clone(), "exports", registry)
            .shutdown_when_queue_empty()
            .run()
            .await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats(Some("exports")).await.unwrap().completed, 1);

        let fired = schedules.get(schedule.id).await.unwrap();
        assert_eq!(fired.run_count, 1);
        assert_eq!(fired.last_status, Some(RunStatus::Success));
        assert!(fired.next_run_at.unwrap() > Utc::now());
    }
}
