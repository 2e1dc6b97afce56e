//! Network health checker.
//!
//! Folds ping outcomes and connection counts into a rolling verdict. After
//! enough consecutive bad checks the state goes Unhealthy and bounded
//! healing runs: a discovery reset on the bus plus closing idle
//! connections. An adaptive operation timeout stretches while the network
//! is slow and shrinks back once it recovers.

use crate::config::HealthOptions;
use crate::events::{EventBus, NetworkEvent, ResetReason, ResetTrigger};
use crate::host::{ConnectionTracker, Dialer};
use crate::types::NetworkHealthState;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Ping outcome counters for the current check period, written by the swarm
/// driver and drained by the health checker.
#[derive(Debug, Default)]
pub struct PingStats {
    successes: AtomicU64,
    timeouts: AtomicU64,
    last_rtt_micros: AtomicU64,
}

impl PingStats {
    /// Record a successful ping round-trip.
    pub fn record_success(&self, rtt: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.last_rtt_micros
            .store(rtt.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a ping failure or timeout.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain the period counters.
    pub fn take_period(&self) -> (u64, u64) {
        (
            self.successes.swap(0, Ordering::Relaxed),
            self.timeouts.swap(0, Ordering::Relaxed),
        )
    }

    /// Most recent round-trip time.
    pub fn last_rtt(&self) -> Duration {
        Duration::from_micros(self.last_rtt_micros.load(Ordering::Relaxed))
    }
}

/// One health check result, kept for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
    /// Verdict after this check.
    pub state: NetworkHealthState,
    /// Total connections at check time.
    pub total_connections: usize,
    /// Period timeout count.
    pub period_timeouts: u64,
    /// Rolling timeout ratio for the period.
    pub timeout_ratio: f64,
    /// Average connection age in seconds.
    pub avg_connection_age_secs: u64,
    /// Current adaptive timeout in milliseconds.
    pub current_timeout_ms: u64,
    /// Healing rounds run in the current unhealthy episode.
    pub healing_attempts: u32,
}

struct CheckerState {
    state: NetworkHealthState,
    consecutive_bad: u32,
    consecutive_good: u32,
    healing_attempts: u32,
    last_healing_at: Option<Instant>,
    last_snapshot: Option<HealthSnapshot>,
}

/// The health checker service.
pub struct NetworkHealthChecker {
    options: HealthOptions,
    dialer: Arc<dyn Dialer>,
    tracker: Arc<ConnectionTracker>,
    ping_stats: Arc<PingStats>,
    bus: EventBus,
    state: Mutex<CheckerState>,
    current_timeout: RwLock<Duration>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NetworkHealthChecker {
    /// Create a checker over the given connection view.
    pub fn new(
        options: HealthOptions,
        dialer: Arc<dyn Dialer>,
        tracker: Arc<ConnectionTracker>,
        ping_stats: Arc<PingStats>,
        bus: EventBus,
    ) -> Self {
        let current_timeout = options.min_timeout;
        Self {
            options,
            dialer,
            tracker,
            ping_stats,
            bus,
            state: Mutex::new(CheckerState {
                state: NetworkHealthState::Healthy,
                consecutive_bad: 0,
                consecutive_good: 0,
                healing_attempts: 0,
                last_healing_at: None,
                last_snapshot: None,
            }),
            current_timeout: RwLock::new(current_timeout),
            stop_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Start the periodic check loop.
    pub fn start(self: &Arc<Self>) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(stop_tx);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.options.check_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        this.run_check().await;
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("health checker stopped");
        });
        *self.task.lock() = Some(handle);
    }

    /// Stop the check loop and wait for it.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(true);
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Current health state.
    pub fn health_state(&self) -> NetworkHealthState {
        self.state.lock().state
    }

    /// Current adaptive operation timeout.
    pub fn current_timeout(&self) -> Duration {
        *self.current_timeout.read()
    }

    /// Most recent check snapshot.
    pub fn snapshot(&self) -> Option<HealthSnapshot> {
        self.state.lock().last_snapshot.clone()
    }

    /// Run one check. Public so tests and diagnostics can step the state
    /// machine deterministically.
    pub async fn run_check(&self) {
        let total = self.dialer.connected_peers().len();
        let (successes, timeouts) = self.ping_stats.take_period();
        let samples = successes + timeouts;
        let ratio = if samples == 0 {
            0.0
        } else {
            timeouts as f64 / samples as f64
        };
        let avg_age = {
            let snapshot = self.tracker.snapshot();
            if snapshot.is_empty() {
                Duration::ZERO
            } else {
                let sum: Duration = snapshot
                    .iter()
                    .map(|(_, c)| c.established_at.elapsed())
                    .sum();
                sum / snapshot.len() as u32
            }
        };

        let bad = ratio >= self.options.timeout_ratio_threshold || total < 3;
        self.adapt_timeout(ratio);

        let mut heal_now = false;
        {
            let mut state = self.state.lock();
            if bad {
                state.consecutive_bad += 1;
                state.consecutive_good = 0;
            } else {
                state.consecutive_good += 1;
                state.consecutive_bad = 0;
            }

            let previous = state.state;
            state.state = match previous {
                NetworkHealthState::Healthy | NetworkHealthState::Degraded => {
                    if state.consecutive_bad >= self.options.unhealthy_threshold {
                        NetworkHealthState::Unhealthy
                    } else if state.consecutive_bad > 0 {
                        NetworkHealthState::Degraded
                    } else {
                        NetworkHealthState::Healthy
                    }
                }
                NetworkHealthState::Unhealthy => {
                    if state.consecutive_good >= self.options.healthy_threshold {
                        state.healing_attempts = 0;
                        NetworkHealthState::Healthy
                    } else {
                        NetworkHealthState::Unhealthy
                    }
                }
            };

            if previous != state.state {
                info!(from = ?previous, to = ?state.state, ratio, total, "network health transition");
                self.bus.publish(NetworkEvent::NetworkQualityChanged {
                    healthy: state.state == NetworkHealthState::Healthy,
                });
            }

            if state.state == NetworkHealthState::Unhealthy {
                let cooled = state
                    .last_healing_at
                    .map(|at| at.elapsed() >= self.options.healing_cooldown)
                    .unwrap_or(true);
                if cooled && state.healing_attempts < self.options.max_healing_attempts {
                    state.healing_attempts += 1;
                    state.last_healing_at = Some(Instant::now());
                    heal_now = true;
                }
            }

            state.last_snapshot = Some(HealthSnapshot {
                state: state.state,
                total_connections: total,
                period_timeouts: timeouts,
                timeout_ratio: ratio,
                avg_connection_age_secs: avg_age.as_secs(),
                current_timeout_ms: self.current_timeout().as_millis() as u64,
                healing_attempts: state.healing_attempts,
            });
        }

        if heal_now {
            self.heal().await;
        }
    }

    fn adapt_timeout(&self, ratio: f64) {
        let mut timeout = self.current_timeout.write();
        if ratio >= self.options.timeout_ratio_threshold {
            let stretched = timeout.mul_f64(self.options.timeout_increase_factor);
            *timeout = stretched.min(self.options.max_timeout);
        } else {
            let shrunk = timeout.mul_f64(self.options.timeout_decrease_factor);
            *timeout = shrunk.max(self.options.min_timeout);
        }
    }

    async fn heal(&self) {
        warn!("network unhealthy: publishing discovery reset and closing idle connections");
        self.bus.publish_reset(
            ResetReason::NetworkUnhealthy,
            ResetTrigger::HealthChecker,
            None,
        );
        let idle_cutoff = self.options.idle_connection_timeout;
        for (peer, info) in self.tracker.snapshot() {
            if info.last_activity.elapsed() >= idle_cutoff {
                debug!(peer = %peer, "closing idle connection while healing");
                let _ = self.dialer.disconnect(peer).await;
            }
        }
    }
}
