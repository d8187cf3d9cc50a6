//! Engine flags visible to other subsystems.
//!
//! Three small scalars behind atomics. Writer discipline: only the engine
//! writes `is_ticking`, only the pipeline bootstrap writes `is_loaded`, only
//! the snapshot command writes `snapshot_round`. No lock is needed because
//! the pipeline serializes block application.

use karst_types::RoundId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct AppState {
    is_loaded: AtomicBool,
    is_ticking: AtomicBool,
    /// Snapshot rebuild target round; 0 means snapshot mode is off.
    snapshot_round: AtomicU64,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.is_loaded.load(Ordering::SeqCst)
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.is_loaded.store(loaded, Ordering::SeqCst);
    }

    pub fn is_ticking(&self) -> bool {
        self.is_ticking.load(Ordering::SeqCst)
    }

    /// Try to enter the ticking state. Returns false if a tick is already
    /// in flight.
    pub(crate) fn begin_tick(&self) -> bool {
        self.is_ticking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end_tick(&self) {
        self.is_ticking.store(false, Ordering::SeqCst);
    }

    pub fn snapshot_round(&self) -> Option<RoundId> {
        match self.snapshot_round.load(Ordering::SeqCst) {
            0 => None,
            round => Some(round),
        }
    }

    pub fn set_snapshot_round(&self, round: Option<RoundId>) {
        self.snapshot_round.store(round.unwrap_or(0), Ordering::SeqCst);
    }
}
