//! Maintenance service — background sweeps over live state.
//!
//! DESIGN
//! ======
//! Two tasks, each on its own interval:
//!
//! - Sweep (`PRESENCE_SWEEP_MS`): evicts expired presence entries, tears
//!   down connections whose heartbeat is older than `HEARTBEAT_TIMEOUT_MS`,
//!   and drops live state of rooms that stayed empty past `ROOM_GRACE_MS`.
//! - Flush (`BUFFER_FLUSH_MS`): writes dirty buffers to the room directory.
//!
//! The flush collects dirty snapshots room by room, clears the dirty flags,
//! releases the locks, then calls the directory. This keeps the hot path
//! (in-memory updates) fast and bounds data loss to one flush interval.
//!
//! ERROR HANDLING
//! ==============
//! A failed `store_code` re-marks the room dirty, so the next tick retries
//! and eviction keeps the room in memory until a flush succeeds.

use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::services::{connection, presence};
use crate::state::AppState;

/// Handles for the spawned background tasks.
pub struct MaintenanceTasks {
    sweep: JoinHandle<()>,
    flush: JoinHandle<()>,
}

impl MaintenanceTasks {
    /// Stop both tasks, then run one last flush so dirty buffers reach the
    /// directory before the process exits.
    pub async fn shutdown(self, state: &AppState) -> FlushReport {
        self.sweep.abort();
        self.flush.abort();
        let report = flush_dirty(state).await;
        info!(flushed = report.flushed, failed = report.failed, "maintenance: final flush");
        report
    }
}

/// Counts from one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_presence: usize,
    pub reaped_connections: usize,
    pub evicted_rooms: usize,
}

/// Counts from one flush pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    pub failed: usize,
}

/// Spawn the sweep and flush tasks. Returns handles for shutdown.
pub fn spawn_maintenance_tasks(state: &AppState) -> MaintenanceTasks {
    MaintenanceTasks { sweep: spawn_sweep_task(state.clone()), flush: spawn_flush_task(state.clone()) }
}

pub fn spawn_sweep_task(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.sweep_interval);
        loop {
            interval.tick().await;
            sweep_once_at(&state, Instant::now()).await;
        }
    })
}

pub fn spawn_flush_task(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.buffer_flush_interval);
        loop {
            interval.tick().await;
            flush_dirty(&state).await;
        }
    })
}

/// One sweep pass at `now`.
pub async fn sweep_once_at(state: &AppState, now: Instant) -> SweepReport {
    let report = SweepReport {
        expired_presence: presence::sweep_expired_at(state, now).await,
        reaped_connections: connection::reap_stale_at(state, now).await.len(),
        evicted_rooms: evict_idle_rooms_at(state, now).await,
    };
    if report.reaped_connections > 0 || report.evicted_rooms > 0 {
        let live = state.connections.len().await;
        info!(
            live,
            expired = report.expired_presence,
            reaped = report.reaped_connections,
            evicted = report.evicted_rooms,
            "maintenance: sweep"
        );
    }
    report
}

/// Drop live state of rooms that are empty, clean, and past their grace.
pub async fn evict_idle_rooms_at(state: &AppState, now: Instant) -> usize {
    let grace = state.config.room_grace;
    let mut evicted = 0;
    for (room_id, _) in state.rooms.snapshot().await {
        if state
            .rooms
            .evict_if(&room_id, |room| room.is_evictable_at(now, grace))
            .await
        {
            info!(%room_id, "maintenance: room evicted");
            evicted += 1;
        }
    }
    evicted
}

/// Store every dirty buffer through the directory.
pub async fn flush_dirty(state: &AppState) -> FlushReport {
    // Collect dirty snapshots room by room, clearing flags as we go.
    let mut pending = Vec::new();
    for (room_id, shared) in state.rooms.snapshot().await {
        let mut room = shared.lock().await;
        if room.dirty && !room.evicted {
            room.dirty = false;
            pending.push((room_id, shared.clone(), room.code.clone(), room.language.clone()));
        }
    }

    let mut report = FlushReport::default();
    for (room_id, shared, code, language) in pending {
        match state.directory.store_code(&room_id, &code, &language).await {
            Ok(()) => report.flushed += 1,
            Err(e) => {
                error!(%room_id, error = %e, "maintenance: buffer flush failed");
                shared.lock().await.dirty = true;
                report.failed += 1;
            }
        }
    }
    report
}

#[cfg(test)]
#[path = "maintenance_test.rs"]
mod tests;
