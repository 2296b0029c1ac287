//! Periodic background jobs.
//!
//! A [`BackgroundTask`] waits on its interval and on a stop signal, then
//! runs the job outside that wait. Stopping therefore prevents the next
//! tick from being scheduled but never cuts a running tick short.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::anchor_service::AnchorService;
use crate::clock_engine::ClockEngine;
use crate::ledger::Ledger;

pub struct BackgroundTask {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(task = name, period_ms = period.as_millis() as u64, "background task started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if *stopped.borrow() {
                    break;
                }
                job().await;
            }
            info!(task = name, "background task stopped");
        });
        Self { name, stop, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the loop and wait for any in-flight tick to complete.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            error!(task = self.name, error = %e, "background task ended abnormally");
        }
    }
}

pub fn spawn_clock_monitor(engine: Arc<ClockEngine>, period: Duration) -> BackgroundTask {
    BackgroundTask::spawn("clock_monitor", period, move || {
        let engine = engine.clone();
        async move {
            match tokio::task::spawn_blocking(move || engine.tick_now()).await {
                Ok(Ok(report)) => {
                    if !report.warned.is_empty() || !report.breached.is_empty() {
                        info!(
                            evaluated = report.evaluated,
                            warned = report.warned.len(),
                            breached = report.breached.len(),
                            skipped = report.skipped.len(),
                            "clock tick applied"
                        );
                    } else {
                        debug!(evaluated = report.evaluated, "clock tick idle");
                    }
                    for failure in &report.failed {
                        warn!(clock_id = %failure.clock_id, error = %failure.error, "clock transition failed");
                    }
                }
                Ok(Err(e)) => error!(error = %e, "clock tick failed"),
                Err(e) => error!(error = %e, "clock tick panicked"),
            }
        }
    })
}

/// Re-validate every stream so tampering and gaps are flagged degraded
/// while serving, not only when someone runs an audit by hand.
pub fn spawn_integrity_audit(ledger: Arc<Ledger>, period: Duration) -> BackgroundTask {
    BackgroundTask::spawn("integrity_audit", period, move || {
        let ledger = ledger.clone();
        async move {
            match tokio::task::spawn_blocking(move || ledger.audit_all()).await {
                Ok(Ok(audits)) => {
                    let degraded = audits.iter().filter(|a| !a.is_healthy()).count();
                    if degraded > 0 {
                        warn!(streams = audits.len(), degraded, "integrity audit found degraded streams");
                    } else {
                        debug!(streams = audits.len(), "integrity audit clean");
                    }
                }
                Ok(Err(e)) => error!(error = %e, "integrity audit failed"),
                Err(e) => error!(error = %e, "integrity audit panicked"),
            }
        }
    })
}

pub fn spawn_anchor_job(service: Arc<AnchorService>, period: Duration) -> BackgroundTask {
    BackgroundTask::spawn("anchor_job", period, move || {
        let service = service.clone();
        async move {
            match service.run_now().await {
                Ok(Some(anchor)) => info!(
                    anchor_id = %anchor.anchor_id,
                    events = anchor.event_count,
                    status = ?anchor.verification_status,
                    "anchor run finished"
                ),
                Ok(None) => debug!("anchor run found nothing to seal"),
                Err(e) => error!(error = %e, "anchor run failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_runs_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = BackgroundTask::spawn("counter", Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        task.stop().await;
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 3, "ran {seen} times");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_tick() {
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = finished.clone();
        let task = BackgroundTask::spawn("slow", Duration::from_secs(1), move || {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                flag.fetch_add(1, Ordering::SeqCst);
            }
        });

        // The first tick fires immediately; stop while it is sleeping.
        tokio::time::sleep(Duration::from_secs(5)).await;
        task.stop().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
