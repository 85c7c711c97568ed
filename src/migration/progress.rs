//! Progress tracking and the cooperative pause/cancel signals threaded
//! through the migration saga.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::migration::context::{
    MigrationError, MigrationProgress, MigrationStatus, ProgressConfig,
};

/// Shared, observable status of one running migration.
#[derive(Debug, Clone)]
pub struct StatusCell(Arc<RwLock<MigrationStatus>>);

impl StatusCell {
    /// Creates a cell in the [`Pending`][MigrationStatus::Pending] state.
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(MigrationStatus::Pending)))
    }

    /// Reads the current status.
    pub fn get(&self) -> MigrationStatus {
        *self.0.read()
    }

    /// Moves the migration to a new status.
    pub fn set(&self, status: MigrationStatus) {
        *self.0.write() = status;
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Sender side of the cooperative signals, held by the
/// [`MigrationService`][crate::migration::service::MigrationService].
#[derive(Debug, Clone)]
pub struct MigrationControls {
    pause_tx: Arc<watch::Sender<bool>>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl MigrationControls {
    /// Requests the saga to pause between events.
    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
    }

    /// Lifts a previous pause request.
    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
    }

    /// Requests the saga to stop at the next suspension point.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

/// Receiver side of the cooperative signals, observed by the saga between
/// events and at every suspension point.
#[derive(Debug, Clone)]
pub struct ControlSignals {
    pause_rx: watch::Receiver<bool>,
    cancel_rx: watch::Receiver<bool>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl ControlSignals {
    /// Creates a linked controls/signals pair.
    pub fn channel() -> (MigrationControls, ControlSignals) {
        let (pause_tx, pause_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);

        (
            MigrationControls {
                pause_tx: Arc::new(pause_tx),
                cancel_tx: Arc::clone(&cancel_tx),
            },
            ControlSignals {
                pause_rx,
                cancel_rx,
                cancel_tx,
            },
        )
    }

    /// Creates signals that are never raised, for callers that do not need
    /// pause or cancel.
    pub fn none() -> Self {
        Self::channel().1
    }

    /// True when cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Trips the cancel signal from within the saga, e.g. when the lock
    /// heartbeat loses its lease.
    pub fn trip_cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Cooperative checkpoint: fails when cancelled, parks while paused.
    ///
    /// While parked the status cell shows
    /// [`Paused`][MigrationStatus::Paused] and is restored to the given
    /// status when the pause is lifted.
    pub async fn checkpoint(
        &mut self,
        status: &StatusCell,
        resume_to: MigrationStatus,
        honor_pause: bool,
    ) -> Result<(), MigrationError> {
        if self.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }

        if !honor_pause || !*self.pause_rx.borrow() {
            return Ok(());
        }

        status.set(MigrationStatus::Paused);
        debug!("migration paused");

        loop {
            tokio::select! {
                changed = self.pause_rx.changed() => {
                    if changed.is_err() || !*self.pause_rx.borrow() {
                        break;
                    }
                },
                _ = self.cancel_rx.changed() => {
                    if self.is_cancelled() {
                        return Err(MigrationError::Cancelled);
                    }
                },
            }
        }

        status.set(resume_to);
        debug!("migration resumed");
        Ok(())
    }
}

/// Tracks copy-phase progress and emits reports through the configured
/// callback, gated by event count and wall-clock interval.
pub struct ProgressTracker {
    migration_id: Uuid,
    total_events: u64,
    processed: u64,
    started: Instant,
    last_report: Instant,
    config: ProgressConfig,
}

impl ProgressTracker {
    /// Creates a tracker for the given migration over `total_events`.
    pub fn new(migration_id: Uuid, total_events: u64, config: Option<ProgressConfig>) -> Self {
        let now = Instant::now();
        Self {
            migration_id,
            total_events,
            processed: 0,
            started: now,
            last_report: now,
            config: config.unwrap_or_default(),
        }
    }

    /// Events processed so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Time since the tracker was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Throughput since the tracker was created.
    pub fn events_per_second(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= f64::EPSILON {
            return 0.0;
        }
        self.processed as f64 / secs
    }

    /// Records one processed event and emits a report when one is due.
    pub fn record(&mut self) {
        self.processed += 1;

        let count_due = self.config.report_every_events > 0
            && self.processed % self.config.report_every_events == 0;
        let interval_due = self.last_report.elapsed() >= self.config.report_interval;

        if count_due || interval_due {
            self.emit();
        }
    }

    /// Emits a final report unconditionally.
    pub fn finish(&mut self) {
        self.emit();
    }

    fn emit(&mut self) {
        self.last_report = Instant::now();

        let Some(callback) = self.config.callback.as_ref() else {
            return;
        };

        callback(&MigrationProgress {
            migration_id: self.migration_id,
            processed_events: self.processed,
            total_events: self.total_events,
            elapsed: self.elapsed(),
            events_per_second: self.events_per_second(),
        });
    }
}
