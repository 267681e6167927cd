//! Live position watch driving the geofence state machine.
//!
//! The watcher owns the [`AlertState`] and evaluates each position fix as it
//! arrives. Alerts raised by one fix are delivered together after a short
//! delay; delivery never blocks evaluation of later fixes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::geo::LatLng;
use crate::geofence::{evaluate, AlertBatch, AlertConfig, AlertState, AlertZone};
use crate::RmError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable: {0}")]
    Unavailable(String),
    #[error("position request timed out")]
    Timeout,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PositionUpdate {
    Fix(LatLng),
    Error(PositionError),
}

/// Presentation side of an alert: a text notification and an alert sound.
pub trait AlertSink: Send + Sync + 'static {
    fn notify(&self, batch: &AlertBatch) -> Result<(), RmError>;

    fn play_sound(&self, _batch: &AlertBatch) -> Result<(), RmError> {
        Ok(())
    }
}

/// "Alert active" flag; at most one holder at a time.
#[derive(Clone, Debug, Default)]
pub struct AlertGate {
    active: Arc<AtomicBool>,
}

pub struct GateGuard {
    active: Arc<AtomicBool>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

impl AlertGate {
    pub fn try_acquire(&self) -> Option<GateGuard> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GateGuard {
                active: Arc::clone(&self.active),
            })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Handle to a running watch. Dropping it stops the watch as well.
pub struct WatchHandle {
    stop_tx: oneshot::Sender<()>,
    zones_tx: watch::Sender<Vec<AlertZone>>,
    task: JoinHandle<AlertState>,
}

impl WatchHandle {
    /// Replace the zone set used for subsequent fixes.
    pub fn update_zones(&self, zones: Vec<AlertZone>) {
        self.zones_tx.send_replace(zones);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop evaluating and release the position feed.
    pub async fn stop(self) -> AlertState {
        let WatchHandle { stop_tx, task, .. } = self;
        let _ = stop_tx.send(());
        join_watch(task).await
    }

    /// Wait for the feed to end on its own.
    pub async fn finished(self) -> AlertState {
        let WatchHandle { stop_tx, task, .. } = self;
        let state = join_watch(task).await;
        drop(stop_tx);
        state
    }
}

async fn join_watch(task: JoinHandle<AlertState>) -> AlertState {
    match task.await {
        Ok(state) => state,
        Err(err) => {
            warn!(error = %err, "geofence watch task failed");
            AlertState::default()
        }
    }
}

pub fn spawn_watch(
    feed: mpsc::Receiver<PositionUpdate>,
    zones: Vec<AlertZone>,
    config: AlertConfig,
    sink: Arc<dyn AlertSink>,
) -> WatchHandle {
    let (stop_tx, stop_rx) = oneshot::channel();
    let (zones_tx, zones_rx) = watch::channel(zones);
    let task = tokio::spawn(run_watch(feed, stop_rx, zones_rx, config, sink));
    WatchHandle {
        stop_tx,
        zones_tx,
        task,
    }
}

async fn run_watch(
    mut feed: mpsc::Receiver<PositionUpdate>,
    mut stop_rx: oneshot::Receiver<()>,
    zones_rx: watch::Receiver<Vec<AlertZone>>,
    config: AlertConfig,
    sink: Arc<dyn AlertSink>,
) -> AlertState {
    let gate = AlertGate::default();
    let cooldown = config.cooldown();
    let timeout = config.position_timeout();
    let mut state = AlertState::default();
    info!(zones = zones_rx.borrow().len(), "geofence watch started");

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => {
                debug!("geofence watch stopped");
                break;
            }
            update = tokio::time::timeout(timeout, feed.recv()) => match update {
                Err(_) => {
                    warn!(
                        timeout_ms = config.position_timeout_ms,
                        "no position fix within timeout; alerts resume with the next fix"
                    );
                }
                Ok(None) => {
                    debug!("position feed closed");
                    break;
                }
                Ok(Some(PositionUpdate::Error(err))) => {
                    warn!(error = %err, "position feed reported an error");
                }
                Ok(Some(PositionUpdate::Fix(position))) => {
                    let zones = zones_rx.borrow().clone();
                    let now = Utc::now();
                    let (next, events) = evaluate(position, &zones, state, now, cooldown);
                    state = next;
                    if !events.is_empty() {
                        debug!(alerts = events.len(), "zones entered");
                        schedule_delivery(
                            AlertBatch::new(events, now),
                            config.batch_delay(),
                            Arc::clone(&sink),
                            gate.clone(),
                        );
                    }
                }
            }
        }
    }
    // Dropping the receiver here releases the feed subscription.
    drop(feed);
    state
}

fn schedule_delivery(
    batch: AlertBatch,
    delay: std::time::Duration,
    sink: Arc<dyn AlertSink>,
    gate: AlertGate,
) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let delivery = tokio::task::spawn_blocking(move || deliver(&batch, sink.as_ref(), &gate));
        if let Err(err) = delivery.await {
            warn!(error = %err, "alert delivery task failed");
        }
    });
}

fn deliver(batch: &AlertBatch, sink: &dyn AlertSink, gate: &AlertGate) {
    if let Err(err) = sink.notify(batch) {
        warn!(error = %err, "alert notification failed");
    }
    match gate.try_acquire() {
        Some(_guard) => {
            if let Err(err) = sink.play_sound(batch) {
                warn!(error = %err, "alert sound failed");
            }
        }
        None => debug!("alert sound already playing; skipping"),
    }
}
