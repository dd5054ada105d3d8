//! Integration tests for the scheduler, driven by a manual clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use tokio::sync::Semaphore;
use tokio::time::timeout;

use kairos_core::{
    Error, JobId, MetricsCollector, PoolConfig, PoolState, ShutdownCoordinator, ShutdownMode,
};
use kairos_pool::WorkerPool;
use kairos_scheduler::{
    FireOutcome, FireSchedule, JobSpec, ManualClock, OverlapPolicy, Scheduler, Trigger,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

fn pool(workers: usize, queue: usize) -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(PoolConfig::new(workers, queue)).unwrap())
}

fn every(secs: u64) -> Trigger {
    Trigger::interval(Duration::from_secs(secs)).unwrap()
}

/// Poll `check` until it holds or the test times out.
async fn eventually(check: impl Fn() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn interval_job_fires_once_per_tick() {
    let clock = ManualClock::new(t0());
    let scheduler = Scheduler::new(clock.clone());
    let pool = pool(2, 16);
    let runs = Arc::new(AtomicUsize::new(0));

    let id = {
        let runs = Arc::clone(&runs);
        scheduler
            .add_job(
                JobSpec::new(every(10), Arc::clone(&pool), move |_| {
                    let runs = Arc::clone(&runs);
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .overlap(OverlapPolicy::Queue),
            )
            .unwrap()
    };
    assert_eq!(
        scheduler.job(id).unwrap().next_fire,
        Some(t0() + TimeDelta::seconds(10))
    );
    assert!(scheduler.fire_due().is_empty());

    let k = 5;
    let mut fired_at = Vec::new();
    for _ in 0..k {
        clock.advance(Duration::from_secs(10));
        let firings = scheduler.fire_due();
        assert_eq!(firings.len(), 1);
        assert!(firings[0].outcome.is_submitted());
        fired_at.push(firings[0].scheduled_for);
    }

    assert!(fired_at.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(scheduler.job(id).unwrap().fired, k);

    pool.shutdown(ShutdownMode::Graceful).await;
    assert_eq!(runs.load(Ordering::SeqCst), k as usize);
}

#[tokio::test]
async fn due_jobs_fire_in_time_then_id_order() {
    let clock = ManualClock::new(t0());
    let scheduler = Scheduler::new(clock.clone());
    let pool = pool(1, 16);

    let slow = scheduler
        .add_job(JobSpec::new(every(5), Arc::clone(&pool), |_| async { Ok(()) }))
        .unwrap();
    let fast = scheduler
        .add_job(JobSpec::new(every(3), Arc::clone(&pool), |_| async { Ok(()) }))
        .unwrap();
    let tie = scheduler
        .add_job(JobSpec::new(every(5), Arc::clone(&pool), |_| async { Ok(()) }))
        .unwrap();

    clock.advance(Duration::from_secs(6));
    let order: Vec<JobId> = scheduler.fire_due().iter().map(|f| f.job_id).collect();
    assert_eq!(order, vec![fast, slow, tie]);

    pool.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn skip_policy_drops_overlapping_firings() {
    let clock = ManualClock::new(t0());
    let metrics = Arc::new(MetricsCollector::new());
    let scheduler = Scheduler::with_observer(clock.clone(), metrics.clone());
    let pool = pool(1, 4);
    let gate = Arc::new(Semaphore::new(0));

    let id = {
        let gate = Arc::clone(&gate);
        scheduler
            .add_job(
                JobSpec::new(every(1), Arc::clone(&pool), move |_| {
                    let gate = Arc::clone(&gate);
                    async move {
                        let _permit = gate.acquire().await;
                        Ok(())
                    }
                })
                .name("compact")
                .overlap(OverlapPolicy::Skip),
            )
            .unwrap()
    };

    clock.advance(Duration::from_secs(1));
    assert!(scheduler.fire_due()[0].outcome.is_submitted());

    clock.advance(Duration::from_secs(1));
    let firing = scheduler.fire_due();
    assert!(matches!(firing[0].outcome, FireOutcome::Skipped));
    // the fire time still advanced
    assert_eq!(
        scheduler.job(id).unwrap().next_fire,
        Some(t0() + TimeDelta::seconds(3))
    );

    gate.add_permits(1);
    eventually(|| scheduler.job(id).unwrap().in_flight == 0).await;

    clock.advance(Duration::from_secs(1));
    assert!(scheduler.fire_due()[0].outcome.is_submitted());

    let info = scheduler.job(id).unwrap();
    assert_eq!(info.name, "compact");
    assert_eq!(info.fired, 2);
    assert_eq!(info.skipped, 1);

    let snapshot = metrics.snapshot();
    let job = &snapshot.jobs[&id.to_string()];
    assert_eq!(job.fired, 2);
    assert_eq!(job.skipped, 1);

    gate.add_permits(1);
    pool.shutdown(ShutdownMode::Graceful).await;
}

/// Park a task on every worker of `pool` until `gate` hands out permits.
async fn occupy_workers(pool: &WorkerPool, gate: &Arc<Semaphore>) {
    let workers = pool.config().worker_count;
    for _ in 0..workers {
        let gate = Arc::clone(gate);
        pool.spawn(move |_| async move {
            let _permit = gate.acquire().await;
            Ok(())
        })
        .unwrap();
    }
    eventually(|| pool.stats().active == workers).await;
}

#[tokio::test]
async fn skip_policy_counts_queued_firings() {
    let clock = ManualClock::new(t0());
    let scheduler = Scheduler::new(clock.clone());
    let pool = pool(1, 4);
    let gate = Arc::new(Semaphore::new(0));
    occupy_workers(&pool, &gate).await;

    let id = scheduler
        .add_job(JobSpec::new(every(1), Arc::clone(&pool), |_| async { Ok(()) }))
        .unwrap();

    clock.advance(Duration::from_secs(1));
    assert!(scheduler.fire_due()[0].outcome.is_submitted());
    // queued behind the busy worker, not started
    assert_eq!(pool.stats().queued, 1);
    assert_eq!(scheduler.job(id).unwrap().in_flight, 1);

    clock.advance(Duration::from_secs(1));
    assert!(matches!(
        scheduler.fire_due()[0].outcome,
        FireOutcome::Skipped
    ));

    gate.add_permits(1);
    eventually(|| scheduler.job(id).unwrap().in_flight == 0).await;

    clock.advance(Duration::from_secs(1));
    assert!(scheduler.fire_due()[0].outcome.is_submitted());
    pool.shutdown(ShutdownMode::Graceful).await;

    let info = scheduler.job(id).unwrap();
    assert_eq!(info.fired, 2);
    assert_eq!(info.skipped, 1);
}

#[tokio::test]
async fn aborted_pool_releases_queued_firing() {
    let clock = ManualClock::new(t0());
    let scheduler = Scheduler::new(clock.clone());
    let pool = pool(1, 4);
    let gate = Arc::new(Semaphore::new(0));
    occupy_workers(&pool, &gate).await;

    let runs = Arc::new(AtomicUsize::new(0));
    let id = {
        let runs = Arc::clone(&runs);
        scheduler
            .add_job(JobSpec::new(every(1), Arc::clone(&pool), move |_| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .unwrap()
    };

    clock.advance(Duration::from_secs(1));
    assert!(scheduler.fire_due()[0].outcome.is_submitted());
    assert_eq!(scheduler.job(id).unwrap().in_flight, 1);

    let report = timeout(TIMEOUT, pool.shutdown(ShutdownMode::Abort))
        .await
        .unwrap();
    assert_eq!(report.discarded, 1);
    assert_eq!(scheduler.job(id).unwrap().in_flight, 0);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn queue_policy_is_bounded_by_the_pool() {
    let clock = ManualClock::new(t0());
    let scheduler = Scheduler::new(clock.clone());
    let pool = pool(1, 1);
    let gate = Arc::new(Semaphore::new(0));

    let id = {
        let gate = Arc::clone(&gate);
        scheduler
            .add_job(
                JobSpec::new(every(1), Arc::clone(&pool), move |_| {
                    let gate = Arc::clone(&gate);
                    async move {
                        let _permit = gate.acquire().await;
                        Ok(())
                    }
                })
                .overlap(OverlapPolicy::Queue),
            )
            .unwrap()
    };

    let mut outcomes = Vec::new();
    clock.advance(Duration::from_secs(1));
    outcomes.extend(scheduler.fire_due().into_iter().map(|f| f.outcome));
    // first firing occupies the only worker
    eventually(|| pool.stats().active == 1).await;

    for _ in 0..2 {
        clock.advance(Duration::from_secs(1));
        outcomes.extend(scheduler.fire_due().into_iter().map(|f| f.outcome));
    }

    assert!(outcomes[0].is_submitted());
    assert!(outcomes[1].is_submitted());
    assert!(matches!(
        outcomes[2],
        FireOutcome::Rejected(Error::QueueFull { .. })
    ));

    let info = scheduler.job(id).unwrap();
    assert_eq!(info.fired, 2);
    assert_eq!(info.rejected, 1);
    assert_eq!(info.in_flight, 2);

    gate.add_permits(2);
    pool.shutdown(ShutdownMode::Graceful).await;
    assert_eq!(scheduler.job(id).unwrap().in_flight, 0);
}

#[tokio::test]
async fn removing_jobs() {
    let clock = ManualClock::new(t0());
    let scheduler = Scheduler::new(clock.clone());
    let pool = pool(1, 4);

    assert!(!scheduler.remove_job(JobId::new(999)));
    assert!(matches!(
        scheduler.job(JobId::new(999)),
        Err(Error::JobNotFound(id)) if id == JobId::new(999)
    ));

    let first = scheduler
        .add_job(JobSpec::new(every(1), Arc::clone(&pool), |_| async { Ok(()) }))
        .unwrap();
    assert!(scheduler.remove_job(first));
    assert!(!scheduler.remove_job(first));

    clock.advance(Duration::from_secs(2));
    assert!(scheduler.fire_due().is_empty());

    // ids are never reused
    let second = scheduler
        .add_job(JobSpec::new(every(1), Arc::clone(&pool), |_| async { Ok(()) }))
        .unwrap();
    assert!(second > first);
    assert_eq!(scheduler.jobs().len(), 1);

    pool.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn invalid_triggers_are_rejected() {
    let scheduler = Scheduler::new(ManualClock::new(t0()));
    let pool = pool(1, 1);

    assert!(matches!(
        Trigger::cron("every tuesday"),
        Err(Error::InvalidConfig(_))
    ));

    let err = scheduler
        .add_job(JobSpec::new(
            Trigger::Interval(Duration::ZERO),
            Arc::clone(&pool),
            |_| async { Ok(()) },
        ))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
    assert!(scheduler.jobs().is_empty());
}

#[tokio::test]
async fn cron_job_fires_on_calendar_instants() {
    let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 30).unwrap();
    let clock = ManualClock::new(start);
    let scheduler = Scheduler::new(clock.clone());
    let pool = pool(1, 4);

    let id = scheduler
        .add_job(JobSpec::new(
            Trigger::cron("* * * * *").unwrap(),
            Arc::clone(&pool),
            |_| async { Ok(()) },
        ))
        .unwrap();
    let minute = |m| Utc.with_ymd_and_hms(2026, 1, 1, 0, m, 0).unwrap();
    assert_eq!(scheduler.job(id).unwrap().next_fire, Some(minute(1)));

    clock.advance(Duration::from_secs(29));
    assert!(scheduler.fire_due().is_empty());

    clock.advance(Duration::from_secs(1));
    let firings = scheduler.fire_due();
    assert_eq!(firings.len(), 1);
    assert_eq!(firings[0].scheduled_for, minute(1));
    assert_eq!(scheduler.job(id).unwrap().next_fire, Some(minute(2)));

    pool.shutdown(ShutdownMode::Graceful).await;
}

struct Twice {
    first: DateTime<Utc>,
    second: DateTime<Utc>,
}

impl FireSchedule for Twice {
    fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        [self.first, self.second].into_iter().find(|at| *at > now)
    }

    fn describe(&self) -> String {
        "twice".to_string()
    }
}

#[tokio::test]
async fn exhausted_custom_trigger_goes_dormant() {
    let clock = ManualClock::new(t0());
    let scheduler = Scheduler::new(clock.clone());
    let pool = pool(1, 4);

    let id = scheduler
        .add_job(
            JobSpec::new(
                Trigger::custom(Twice {
                    first: t0() + TimeDelta::seconds(1),
                    second: t0() + TimeDelta::seconds(2),
                }),
                Arc::clone(&pool),
                |_| async { Ok(()) },
            )
            .overlap(OverlapPolicy::Queue),
        )
        .unwrap();
    assert_eq!(scheduler.job(id).unwrap().trigger, "twice");

    for _ in 0..4 {
        clock.advance(Duration::from_secs(1));
        scheduler.fire_due();
    }
    let info = scheduler.job(id).unwrap();
    assert_eq!(info.fired, 2);
    assert_eq!(info.next_fire, None);

    pool.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn running_loop_follows_the_clock() {
    let clock = ManualClock::new(t0());
    let scheduler = Scheduler::new(clock.clone());
    let pool = pool(1, 8);
    let runs = Arc::new(AtomicUsize::new(0));

    scheduler.start().unwrap();
    assert!(matches!(scheduler.start(), Err(Error::AlreadyStarted)));

    {
        let runs = Arc::clone(&runs);
        scheduler
            .add_job(JobSpec::new(every(1), Arc::clone(&pool), move |_| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .unwrap();
    }

    for expected in 1..=3 {
        clock.advance(Duration::from_secs(1));
        eventually(|| runs.load(Ordering::SeqCst) >= expected).await;
    }

    timeout(TIMEOUT, scheduler.stop()).await.unwrap();
    assert_eq!(scheduler.state(), PoolState::Stopped);

    // stopped: the clock moving no longer fires anything
    clock.advance(Duration::from_secs(5));
    assert!(scheduler.fire_due().is_empty());
    assert!(matches!(scheduler.start(), Err(Error::ShuttingDown)));

    pool.shutdown(ShutdownMode::Graceful).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn dropped_stop_call_still_stops() {
    let scheduler = Scheduler::new(ManualClock::new(t0()));
    scheduler.start().unwrap();

    // Polled once, then abandoned before the loop has been joined.
    let abandoned = tokio::select! {
        biased;
        _ = scheduler.stop() => false,
        _ = std::future::ready(()) => true,
    };
    assert!(abandoned);
    assert_eq!(scheduler.state(), PoolState::Draining);

    timeout(TIMEOUT, scheduler.stop())
        .await
        .expect("a later stop should observe the detached completion");
    assert_eq!(scheduler.state(), PoolState::Stopped);
}

#[tokio::test]
async fn stop_does_not_retract_submitted_tasks() {
    let clock = ManualClock::new(t0());
    let scheduler = Scheduler::new(clock.clone());
    let pool = pool(1, 4);
    let gate = Arc::new(Semaphore::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    {
        let gate = Arc::clone(&gate);
        let done = Arc::clone(&done);
        scheduler
            .add_job(JobSpec::new(every(1), Arc::clone(&pool), move |_| {
                let gate = Arc::clone(&gate);
                let done = Arc::clone(&done);
                async move {
                    let _permit = gate.acquire().await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .unwrap();
    }

    clock.advance(Duration::from_secs(1));
    assert_eq!(scheduler.fire_due().len(), 1);
    scheduler.stop().await;

    gate.add_permits(1);
    pool.shutdown(ShutdownMode::Graceful).await;
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn coordinator_stops_scheduler_before_pool() {
    let clock = ManualClock::new(t0());
    let pool = pool(1, 4);
    let scheduler = Arc::new(Scheduler::new(clock.clone()));
    scheduler.start().unwrap();

    let coordinator = ShutdownCoordinator::new();
    coordinator.register(pool.clone()).unwrap();
    coordinator.register(scheduler.clone()).unwrap();

    timeout(TIMEOUT, coordinator.shutdown_all(ShutdownMode::Graceful))
        .await
        .unwrap();
    assert_eq!(scheduler.state(), PoolState::Stopped);
    assert_eq!(pool.state(), PoolState::Stopped);
    assert!(matches!(
        scheduler.add_job(JobSpec::new(every(1), Arc::clone(&pool), |_| async { Ok(()) })),
        Err(Error::ShuttingDown)
    ));
}

#[tokio::test]
async fn job_info_serializes() {
    let scheduler = Scheduler::new(ManualClock::new(t0()));
    let pool = pool(1, 1);
    let id = scheduler
        .add_job(JobSpec::new(every(30), Arc::clone(&pool), |_| async { Ok(()) }).name("flush"))
        .unwrap();

    let json = serde_json::to_value(scheduler.job(id).unwrap()).unwrap();
    assert_eq!(json["name"], "flush");
    assert_eq!(json["trigger"], "every 30s");
    assert_eq!(json["overlap"], "Skip");
    assert_eq!(json["pool"], "pool");
    assert_eq!(json["in_flight"], 0);
}
