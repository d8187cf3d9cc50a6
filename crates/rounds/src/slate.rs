//! Delegate slate generation.
//!
//! A slate is the ordered list of N public keys authorized to forge the
//! slots of one round. Two algorithms exist, selected by height against the
//! `dposv2_first_block` fork constant:
//!
//! * **v1** ranks delegates by `(vote DESC, public_key ASC)`, takes the top
//!   N and applies a Fisher–Yates shuffle seeded from the round number.
//! * **v2** draws N delegates without replacement, each draw weighted by
//!   `votes_weight`, from a stream seeded by the round number and the id of
//!   the preceding round's last block.
//!
//! Both streams are ChaCha20 keyed with a blake3 digest of the seed inputs,
//! and every index draw uses explicit rejection sampling over `next_u64`,
//! so agreement between nodes depends only on this module, never on the
//! internals of a `rand` distribution.

use crate::config::RoundsConfig;
use crate::math;
use crate::RoundsError;
use blake3::Hasher as Blake3;
use karst_storage::{AccountFilter, AccountStore, BlockStore};
use karst_types::{ranked, Height, PublicKey, RoundId, Satoshi};
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const SLATE_V1_DOMAIN: &[u8] = b"karst.slate.v1";
const SLATE_V2_DOMAIN: &[u8] = b"karst.slate.v2";
/// Rounds of finished slates kept in the cache.
const CACHE_ROUNDS: u64 = 4;

/// Source of the per-round forger list.
pub trait DelegatesProvider: Send + Sync {
    /// Ordered list of public keys authorized to forge the slots of the
    /// round containing `height`; position `i` forges slot `i`.
    ///
    /// Contract: a pure function of the persisted state visible before the
    /// round's first height plus the constants table. Callers may cache per
    /// round.
    fn generate_delegate_list(&self, height: Height) -> Result<Vec<PublicKey>, RoundsError>;
}

/// Slate generator over the account and block stores, cached per round.
pub struct SlateGenerator {
    config: RoundsConfig,
    accounts: Arc<dyn AccountStore>,
    blocks: Arc<dyn BlockStore>,
    cache: Mutex<HashMap<(RoundId, bool), Vec<PublicKey>>>,
}

fn seeded_rng(domain: &[u8], round: RoundId, extra: &[u8]) -> ChaCha20Rng {
    let mut hasher = Blake3::new();
    hasher.update(domain);
    hasher.update(&round.to_be_bytes());
    hasher.update(extra);
    ChaCha20Rng::from_seed(*hasher.finalize().as_bytes())
}

/// Uniform draw in `[0, bound)` by rejection sampling.
fn draw_below(rng: &mut ChaCha20Rng, bound: u64) -> u64 {
    debug_assert!(bound > 0);
    let zone = u64::MAX - (u64::MAX % bound);
    loop {
        let value = rng.next_u64();
        if value < zone {
            return value % bound;
        }
    }
}

/// Uniform 128-bit draw in `[0, bound)`, high word first.
fn draw_below_u128(rng: &mut ChaCha20Rng, bound: u128) -> u128 {
    debug_assert!(bound > 0);
    let zone = u128::MAX - (u128::MAX % bound);
    loop {
        let high = rng.next_u64() as u128;
        let low = rng.next_u64() as u128;
        let value = (high << 64) | low;
        if value < zone {
            return value % bound;
        }
    }
}

impl SlateGenerator {
    pub fn new(
        config: RoundsConfig,
        accounts: Arc<dyn AccountStore>,
        blocks: Arc<dyn BlockStore>,
    ) -> Self {
        Self {
            config,
            accounts,
            blocks,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// v1: deterministic top-N by vote, shuffled by the round number.
    fn v1_slate(&self, round: RoundId) -> Result<Vec<PublicKey>, RoundsError> {
        let filter = AccountFilter {
            vote_above: Some(Satoshi::ZERO),
            ..AccountFilter::default()
        };
        let candidates = self.accounts.get_all(&filter)?;

        let mut slate: Vec<PublicKey> = ranked(candidates)
            .into_iter()
            .take(self.config.active_delegates as usize)
            .map(|account| account.public_key)
            .collect();

        let mut rng = seeded_rng(SLATE_V1_DOMAIN, round, &[]);
        for i in (1..slate.len()).rev() {
            let j = draw_below(&mut rng, (i + 1) as u64) as usize;
            slate.swap(i, j);
        }
        Ok(slate)
    }

    /// Seed block id for v2 selection: the last block of the preceding
    /// round. The round's own first block cannot exist when its slate is
    /// drawn, so the preceding tail is the latest datum all nodes share.
    /// Round 1 has no predecessor and seeds from the zero id.
    fn v2_seed(&self, round: RoundId) -> Result<[u8; 32], RoundsError> {
        if round <= 1 {
            return Ok([0u8; 32]);
        }
        let seed_height = math::last_in_round(round - 1, self.config.active_delegates);
        let block = self
            .blocks
            .find_by_height(seed_height)?
            .ok_or_else(|| {
                RoundsError::Invariant(format!(
                    "slate seed block missing at height {seed_height}"
                ))
            })?;
        Ok(block.id)
    }

    /// v2: weighted selection without replacement over `votes_weight`.
    fn v2_slate(&self, round: RoundId) -> Result<Vec<PublicKey>, RoundsError> {
        let filter = AccountFilter {
            votes_weight_above: Some(Satoshi::ZERO),
            exclude_banned: true,
            ..AccountFilter::default()
        };
        let mut candidates = self.accounts.get_all(&filter)?;
        // Fixed iteration order before any draw.
        candidates.sort_by(|a, b| a.public_key.cmp(&b.public_key));

        let mut keys: Vec<PublicKey> = candidates.iter().map(|a| a.public_key).collect();
        let mut weights: Vec<u128> = candidates
            .iter()
            .map(|a| a.votes_weight.raw() as u128)
            .collect();
        let mut total: u128 = 0;
        for weight in &weights {
            total = total
                .checked_add(*weight)
                .ok_or(RoundsError::Arithmetic("v2 weight total"))?;
        }

        let seed = self.v2_seed(round)?;
        let mut rng = seeded_rng(SLATE_V2_DOMAIN, round, &seed);

        let wanted = self.config.active_delegates as usize;
        let mut slate = Vec::with_capacity(wanted.min(keys.len()));
        while slate.len() < wanted && !keys.is_empty() && total > 0 {
            let ticket = draw_below_u128(&mut rng, total);
            let mut cumulative = 0u128;
            let mut chosen = keys.len() - 1;
            for (index, weight) in weights.iter().enumerate() {
                cumulative += weight;
                if ticket < cumulative {
                    chosen = index;
                    break;
                }
            }
            slate.push(keys.remove(chosen));
            total -= weights.remove(chosen);
        }
        Ok(slate)
    }
}

impl DelegatesProvider for SlateGenerator {
    fn generate_delegate_list(&self, height: Height) -> Result<Vec<PublicKey>, RoundsError> {
        let n = self.config.active_delegates;
        let round = math::round_of(height, n);
        let use_v2 = height >= self.config.dposv2_first_block;

        if let Some(cached) = self.cache.lock().get(&(round, use_v2)) {
            return Ok(cached.clone());
        }

        let slate = if use_v2 {
            self.v2_slate(round)?
        } else {
            self.v1_slate(round)?
        };
        debug!(
            target: "rounds",
            round,
            v2 = use_v2,
            delegates = slate.len(),
            "generated delegate slate"
        );

        let mut cache = self.cache.lock();
        cache.retain(|(cached_round, _), _| cached_round + CACHE_ROUNDS > round);
        cache.insert((round, use_v2), slate.clone());
        Ok(slate)
    }
}
