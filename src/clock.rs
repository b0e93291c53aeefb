//! Fixed-interval job runner shared by the ETL worker and the write-back
//! scheduler.
//!
//! Each job runs on its own task. Runs never overlap: a tick that comes due
//! while the previous run is still going is delivered late, and the
//! [`MisfirePolicy`] decides whether a tick later than the grace window still
//! runs. Several missed ticks always collapse into at most one run.

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Run once for any number of late ticks.
    #[default]
    Coalesce,
    /// Drop a tick that is later than the grace window.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSchedule {
    pub interval: Duration,
    pub misfire_grace: Duration,
    pub misfire_policy: MisfirePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    Run,
    Skip,
}

pub fn tick_action(lateness: Duration, schedule: &JobSchedule) -> TickAction {
    if lateness <= schedule.misfire_grace {
        return TickAction::Run;
    }
    match schedule.misfire_policy {
        MisfirePolicy::Coalesce => TickAction::Run,
        MisfirePolicy::Skip => TickAction::Skip,
    }
}

/// Handle to a running periodic job.
pub struct JobHandle {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl JobHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stops the job. A run in progress is cancelled at its next await point.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(job = self.name, error = %e, "job task failed");
        }
        tracing::info!(job = self.name, "job stopped");
    }
}

/// Spawns `job` to run every `schedule.interval`, starting immediately.
pub fn spawn_periodic<F, Fut>(name: &'static str, schedule: JobSchedule, mut job: F) -> JobHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = time::interval(schedule.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let due = tokio::select! {
                due = ticker.tick() => due,
                _ = stop_rx.changed() => break,
            };

            let lateness = Instant::now().saturating_duration_since(due);
            if tick_action(lateness, &schedule) == TickAction::Skip {
                tracing::warn!(
                    job = name,
                    late_ms = lateness.as_millis() as u64,
                    "run time missed by more than the grace window, skipping"
                );
                continue;
            }

            tokio::select! {
                _ = job() => {}
                _ = stop_rx.changed() => {
                    tracing::warn!(job = name, "stopped while running");
                    break;
                }
            }
        }
    });

    JobHandle {
        name,
        stop_tx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn schedule(policy: MisfirePolicy) -> JobSchedule {
        JobSchedule {
            interval: Duration::from_secs(10),
            misfire_grace: Duration::from_secs(1),
            misfire_policy: policy,
        }
    }

    #[test]
    fn test_on_time_tick_runs_under_both_policies() {
        for policy in [MisfirePolicy::Coalesce, MisfirePolicy::Skip] {
            assert_eq!(
                tick_action(Duration::from_millis(500), &schedule(policy)),
                TickAction::Run
            );
        }
    }

    #[test]
    fn test_late_tick_follows_policy() {
        let late = Duration::from_secs(5);
        assert_eq!(
            tick_action(late, &schedule(MisfirePolicy::Coalesce)),
            TickAction::Run
        );
        assert_eq!(
            tick_action(late, &schedule(MisfirePolicy::Skip)),
            TickAction::Skip
        );
    }

    struct Counters {
        runs: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    /// Runs a job that takes 25s on a 10s interval for 99s of paused time.
    async fn slow_job_runs(policy: MisfirePolicy) -> Arc<Counters> {
        let counters = Arc::new(Counters {
            runs: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });

        let c = counters.clone();
        let handle = spawn_periodic("slow", schedule(policy), move || {
            let c = c.clone();
            async move {
                c.runs.fetch_add(1, Ordering::SeqCst);
                let now = c.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                c.max_in_flight.fetch_max(now, Ordering::SeqCst);
                time::sleep(Duration::from_secs(25)).await;
                c.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        });

        time::sleep(Duration::from_secs(99)).await;
        handle.stop().await;
        counters
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_job_never_overlaps() {
        let counters = slow_job_runs(MisfirePolicy::Coalesce).await;
        assert_eq!(counters.max_in_flight.load(Ordering::SeqCst), 1);
        // Starts at 0, 25, 50 and 75.
        assert_eq!(counters.runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_policy_drops_late_ticks() {
        let coalesced = slow_job_runs(MisfirePolicy::Coalesce).await;
        let skipped = slow_job_runs(MisfirePolicy::Skip).await;
        assert_eq!(skipped.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(
            skipped.runs.load(Ordering::SeqCst) < coalesced.runs.load(Ordering::SeqCst),
            "skip ran {} times, coalesce {}",
            skipped.runs.load(Ordering::SeqCst),
            coalesced.runs.load(Ordering::SeqCst)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_idle_job() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let handle = spawn_periodic("idle", schedule(MisfirePolicy::Coalesce), move || {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });
        time::sleep(Duration::from_secs(15)).await;
        assert_eq!(handle.name(), "idle");
        handle.stop().await;
        let after_stop = runs.load(Ordering::SeqCst);
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
        assert_eq!(after_stop, 2);
    }
}
