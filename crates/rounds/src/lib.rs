//! Round lifecycle engine for the karst DPoS node.
//!
//! Partitions the height line into fixed-size rounds of N active delegates,
//! settles each round's rewards and fees at its last block, recomputes the
//! delegate ranking and the next round's slate, and reverses any of it
//! byte-for-byte when blocks roll back. The engine never writes state
//! directly: every mutation is a typed op queued into the caller's batch,
//! which commits atomically or not at all.

pub mod config;
pub mod engine;
pub mod events;
pub mod math;
pub mod ops;
pub mod slate;
pub mod state;

pub use config::RoundsConfig;
pub use engine::RoundEngine;
pub use events::{EventBus, RoundEvent};
pub use ops::RoundContext;
pub use slate::{DelegatesProvider, SlateGenerator};
pub use state::AppState;

#[derive(thiserror::Error, Debug)]
pub enum RoundsError {
    /// Reading blocks or accounts failed; the tick is abandoned and the
    /// caller rolls the transaction back.
    #[error("store read failed: {0}")]
    Store(#[from] anyhow::Error),
    /// Corrupt state detected (genesis mis-sum, slate size mismatch, ...).
    /// The node must halt rather than continue on this state.
    #[error("invariant violation: {0}")]
    Invariant(String),
    /// Checked arithmetic failed while accumulating rewards or fees.
    #[error("arithmetic overflow in {0}")]
    Arithmetic(&'static str),
    /// A second tick was attempted while one was in flight.
    #[error("another tick is already in progress")]
    TickInProgress,
}
