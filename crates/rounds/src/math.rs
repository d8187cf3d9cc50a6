//! Round arithmetic.
//!
//! Pure functions over heights and round numbers. `n` is the number of
//! active delegates and is always passed explicitly; nothing here touches
//! state or configuration.

use karst_types::{Height, RoundId, Satoshi};

/// Round containing the given height: `ceil(height / n)`.
pub fn round_of(height: Height, n: u64) -> RoundId {
    height.div_ceil(n)
}

/// First height belonging to a round.
pub fn first_in_round(round: RoundId, n: u64) -> Height {
    (round - 1) * n + 1
}

/// Last height belonging to a round.
pub fn last_in_round(round: RoundId, n: u64) -> Height {
    round * n
}

/// Does a tick at this height finish a round?
///
/// Height 1 is special: the genesis block counts as its own round-finishing
/// event even though round 1 continues past it.
pub fn is_round_end(height: Height, n: u64) -> bool {
    round_of(height, n) != round_of(height + 1, n) || height == 1
}

/// Split a fee total into per-delegate shares plus the remainder that goes
/// to the round's last forger. `None` when `n` is zero or out of range.
pub fn split_fees(total_fees: Satoshi, n: u64) -> Option<(Satoshi, Satoshi)> {
    total_fees.split(n)
}
