//! Expired Lease Sweeper
//!
//! Optional background task that periodically removes expired rows from the
//! lock table. Every read path already ignores expired leases, so the sweeper
//! only bounds storage growth; a deployment that never runs it stays correct.
//!
//! ```ignore
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let interval = coordination.config().sweep_interval;
//! let handle = tokio::spawn(lock_sweeper_task(coordination.clone(), interval, shutdown_rx));
//!
//! // Later
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

use crate::coordination::AgentCoordination;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// METRICS
// ============================================================================

/// Counters for sweeper activity.
#[derive(Debug, Default)]
pub struct SweeperMetrics {
    /// Sweep cycles completed
    pub sweep_cycles: AtomicU64,
    /// Expired rows removed since startup
    pub locks_purged: AtomicU64,
    /// Cycles that failed with a storage error
    pub sweep_errors: AtomicU64,
}

impl SweeperMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self) -> SweeperSnapshot {
        SweeperSnapshot {
            sweep_cycles: self.sweep_cycles.load(Ordering::Relaxed),
            locks_purged: self.locks_purged.load(Ordering::Relaxed),
            sweep_errors: self.sweep_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sweeper counters at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperSnapshot {
    pub sweep_cycles: u64,
    pub locks_purged: u64,
    pub sweep_errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Purge expired leases every `sweep_interval` until `shutdown_rx` reports
/// `true` or its sender is dropped.
///
/// The first sweep runs immediately. A zero `sweep_interval` falls back to
/// the engine's configured interval. Returns the counters collected over the
/// task's lifetime.
pub async fn lock_sweeper_task(
    coordination: Arc<AgentCoordination>,
    sweep_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SweeperMetrics> {
    let metrics = Arc::new(SweeperMetrics::new());

    let sweep_interval = if sweep_interval.is_zero() {
        let fallback = coordination.config().sweep_interval;
        tracing::warn!(
            fallback_ms = fallback.as_millis() as u64,
            "Zero sweep interval requested, using configured interval"
        );
        fallback
    } else {
        sweep_interval
    };

    let mut ticker = interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        sweep_interval_ms = sweep_interval.as_millis() as u64,
        "Lock sweeper started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Lock sweeper shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                sweep_once(&coordination, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweep_cycles = snapshot.sweep_cycles,
        locks_purged = snapshot.locks_purged,
        sweep_errors = snapshot.sweep_errors,
        "Lock sweeper completed"
    );

    metrics
}

async fn sweep_once(coordination: &AgentCoordination, metrics: &SweeperMetrics) {
    match coordination.purge_expired_locks().await {
        Ok(purged) => {
            metrics
                .locks_purged
                .fetch_add(purged as u64, Ordering::Relaxed);
        }
        Err(e) => {
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, "Lock sweep failed");
        }
    }
    metrics.sweep_cycles.fetch_add(1, Ordering::Relaxed);
}

// ============================================================================
// TESTS
// ============================================================================
