use crate::address::address_from_public_key;
use crate::amount::Satoshi;
use crate::block::{PublicKey, RoundId};
use serde::{Deserialize, Serialize};

/// Persisted state of a delegate account.
///
/// The round engine mutates these rows exclusively through typed store ops;
/// it never creates or deletes an account. `round_audit` is the reversibility
/// trail: one round id pushed per forged block, popped again when the block
/// is rolled back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelegateAccount {
    pub address: String,
    pub public_key: PublicKey,
    /// Confirmed balance.
    pub balance: Satoshi,
    /// Unconfirmed balance.
    pub u_balance: Satoshi,
    /// Sum of the balances of the accounts voting for this delegate.
    pub vote: Satoshi,
    /// Weighted vote consumed by v2 slate selection.
    pub votes_weight: Satoshi,
    pub produced_blocks: u64,
    pub missed_blocks: u64,
    /// Cumulative fee income, settled at round ends.
    pub fees: Satoshi,
    /// Cumulative reward income, settled at round ends.
    pub rewards: Satoshi,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub round_audit: Vec<RoundId>,
}

impl DelegateAccount {
    /// Fresh account for a public key, address derived, all balances zero.
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            address: address_from_public_key(&public_key),
            public_key,
            balance: Satoshi::ZERO,
            u_balance: Satoshi::ZERO,
            vote: Satoshi::ZERO,
            votes_weight: Satoshi::ZERO,
            produced_blocks: 0,
            missed_blocks: 0,
            fees: Satoshi::ZERO,
            rewards: Satoshi::ZERO,
            banned: false,
            round_audit: Vec::new(),
        }
    }
}

/// Sort delegates into ranking order: vote descending, public key ascending
/// (byte-lexicographic tie-break). Position `i` carries rank `i + 1`.
pub fn ranked(mut delegates: Vec<DelegateAccount>) -> Vec<DelegateAccount> {
    delegates.sort_by(|a, b| {
        b.vote
            .cmp(&a.vote)
            .then_with(|| a.public_key.cmp(&b.public_key))
    });
    delegates
}
