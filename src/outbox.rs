use std::{sync::Arc, time::Duration};

use rand::{RngCore, SeedableRng, rngs::StdRng};
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    counter_sync::{CounterSync, SyncError},
    store::{OutboxStore, StoreError},
};

/// Wakes the dispatcher. A no-op handle is used when delivery is not
/// outbox-based.
#[derive(Debug, Clone)]
pub struct OutboxHandle {
    tx: Option<mpsc::UnboundedSender<()>>,
}

impl OutboxHandle {
    pub fn noop() -> Self {
        Self { tx: None }
    }

    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<()>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn notify(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub batch_size: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_attempts: 10,
            batch_size: 64,
        }
    }
}

#[derive(Debug, Clone)]
struct BackoffConfig {
    base: Duration,
    cap: Duration,
    jitter_max_divisor: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter_max_divisor: 4,
        }
    }
}

#[derive(Debug)]
struct BackoffState<R> {
    cfg: BackoffConfig,
    attempt: u32,
    rng: R,
}

impl<R: RngCore> BackoffState<R> {
    fn new(cfg: BackoffConfig, rng: R) -> Self {
        Self {
            cfg,
            attempt: 0,
            rng,
        }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_delay(&mut self) -> Duration {
        let base = base_delay_for_attempt(self.cfg.base, self.cfg.cap, self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let base_ms = base.as_millis().min(u128::from(u64::MAX)) as u64;
        let jitter_max_ms = if self.cfg.jitter_max_divisor == 0 {
            0
        } else {
            base_ms / u64::from(self.cfg.jitter_max_divisor)
        };
        let jitter_ms = if jitter_max_ms == 0 {
            0
        } else {
            self.rng.next_u64() % (jitter_max_ms + 1)
        };

        std::cmp::min(
            self.cfg.cap,
            Duration::from_millis(base_ms.saturating_add(jitter_ms)),
        )
    }
}

fn base_delay_for_attempt(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let mut delay = base;
    for _ in 0..attempt {
        delay = match delay.checked_mul(2) {
            Some(v) => v,
            None => return cap,
        };
        if delay >= cap {
            return cap;
        }
    }
    std::cmp::min(delay, cap)
}

#[derive(Debug)]
struct DispatcherOptions<R> {
    settings: DispatchSettings,
    backoff: BackoffConfig,
    rng: R,
}

/// Starts the background delivery loop. The first pass runs immediately so
/// entries persisted before a restart are picked up.
pub fn spawn_dispatcher(
    store: Arc<dyn OutboxStore>,
    sync: Arc<dyn CounterSync>,
    settings: DispatchSettings,
) -> OutboxHandle {
    spawn_dispatcher_with_options(
        store,
        sync,
        DispatcherOptions {
            settings,
            backoff: BackoffConfig::default(),
            rng: StdRng::from_entropy(),
        },
    )
}

fn spawn_dispatcher_with_options<R: RngCore + Send + 'static>(
    store: Arc<dyn OutboxStore>,
    sync: Arc<dyn CounterSync>,
    options: DispatcherOptions<R>,
) -> OutboxHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(dispatcher_task(store, sync, rx, options));
    OutboxHandle { tx: Some(tx) }
}

async fn dispatcher_task<R: RngCore>(
    store: Arc<dyn OutboxStore>,
    sync: Arc<dyn CounterSync>,
    mut rx: mpsc::UnboundedReceiver<()>,
    options: DispatcherOptions<R>,
) {
    let settings = options.settings;
    let mut pending = true;
    let mut backoff_until: Option<Instant> = None;
    let mut backoff = BackoffState::new(options.backoff, options.rng);

    let mut periodic = tokio::time::interval_at(
        Instant::now() + settings.poll_interval,
        settings.poll_interval,
    );
    periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let run_at = if pending {
            Some(backoff_until.unwrap_or_else(Instant::now))
        } else {
            None
        };

        tokio::select! {
            _ = periodic.tick() => {
                pending = true;
            }
            maybe = rx.recv() => {
                match maybe {
                    Some(()) => pending = true,
                    None => break,
                }
            }
            _ = async {
                if let Some(at) = run_at {
                    tokio::time::sleep_until(at).await;
                }
            }, if run_at.is_some() => {
                match dispatch_once(store.as_ref(), sync.as_ref(), &settings).await {
                    Ok(report) if report.interrupted.is_none() => {
                        backoff.reset();
                        backoff_until = None;
                        // A full batch may mean more entries are waiting.
                        pending = report.examined == settings.batch_size;
                    }
                    Ok(report) => {
                        let delay = backoff.next_delay();
                        debug!(
                            delivered = report.delivered,
                            error = ?report.interrupted,
                            ?delay,
                            "outbox delivery interrupted; backing off"
                        );
                        backoff_until = Some(Instant::now() + delay);
                    }
                    Err(err) => {
                        let delay = backoff.next_delay();
                        warn!(%err, ?delay, "outbox store error; backing off");
                        backoff_until = Some(Instant::now() + delay);
                    }
                }
            }
        }
    }
    debug!("outbox dispatcher stopped");
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub examined: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Set when a transient failure stopped the pass early.
    pub interrupted: Option<SyncError>,
}

/// Delivers up to one batch of pending entries, oldest first.
///
/// Delivered entries are removed. Permanent rejections and entries that hit
/// `max_attempts` are parked as failed. Any other failure records the attempt
/// and ends the pass so the caller can back off.
pub async fn dispatch_once(
    store: &dyn OutboxStore,
    sync: &dyn CounterSync,
    settings: &DispatchSettings,
) -> Result<DispatchReport, StoreError> {
    let entries = store.pending_outbox(settings.batch_size)?;
    let mut report = DispatchReport {
        examined: entries.len(),
        ..Default::default()
    };

    for entry in entries {
        match sync.send(&entry.adjustment, Some(&entry.id)).await {
            Ok(()) => {
                store.complete_outbox(&entry.id)?;
                report.delivered += 1;
                info!(
                    outbox_id = %entry.id,
                    post_id = entry.post_id,
                    user_id = entry.adjustment.user_id,
                    "counter adjustment delivered"
                );
            }
            Err(err) if err.is_permanent() => {
                store.record_outbox_attempt(&entry.id, &err.to_string(), true)?;
                report.failed += 1;
                error!(
                    outbox_id = %entry.id,
                    post_id = entry.post_id,
                    user_id = entry.adjustment.user_id,
                    %err,
                    "counter adjustment rejected; parked as failed"
                );
            }
            Err(err) => {
                let give_up = entry.attempts.saturating_add(1) >= settings.max_attempts;
                store.record_outbox_attempt(&entry.id, &err.to_string(), give_up)?;
                if give_up {
                    report.failed += 1;
                    error!(
                        outbox_id = %entry.id,
                        attempts = settings.max_attempts,
                        %err,
                        "counter adjustment out of attempts; parked as failed"
                    );
                    continue;
                }
                warn!(
                    outbox_id = %entry.id,
                    attempt = entry.attempts + 1,
                    %err,
                    "counter adjustment delivery failed"
                );
                report.interrupted = Some(err);
                break;
            }
        }
    }

    Ok(report)
}
