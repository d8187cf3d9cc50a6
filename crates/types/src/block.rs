use crate::amount::Satoshi;
use blake3::Hasher as Blake3;
use serde::{Deserialize, Serialize};
use serde_bytes;

/// 1-based block height.
pub type Height = u64;
/// Unique identifier for a reward round.
pub type RoundId = u64;
/// Canonical identifier for a block (32-byte digest).
pub type BlockId = [u8; 32];
/// Delegate public key (32 bytes).
pub type PublicKey = [u8; 32];

/// The block fields the round engine reads.
///
/// Transactions are carried elsewhere in the pipeline; the engine only ever
/// consumes the header-level totals persisted here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    /// Canonical identifier (hash of the remaining fields).
    pub id: BlockId,
    /// Height of this block, 1-based.
    pub height: Height,
    /// Identifier of the parent block; `None` only for genesis.
    pub previous_block: Option<BlockId>,
    /// Protocol timestamp, seconds.
    pub timestamp: u64,
    /// Public key of the delegate that forged this block.
    pub generator_public_key: PublicKey,
    /// Sum of the fees of the block's transactions.
    pub total_fee: Satoshi,
    /// Forging reward for this height per the reward schedule.
    pub reward: Satoshi,
    /// Digest of the block payload.
    pub payload_hash: [u8; 32],
    /// Signature issued by the generator.
    #[serde(default, with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Block {
    /// Compute the canonical identifier for the supplied block fields.
    fn compute_id(
        height: Height,
        previous_block: Option<&BlockId>,
        timestamp: u64,
        generator_public_key: &PublicKey,
        total_fee: Satoshi,
        reward: Satoshi,
        payload_hash: &[u8; 32],
    ) -> BlockId {
        let mut hasher = Blake3::new();
        hasher.update(&height.to_be_bytes());
        if let Some(previous) = previous_block {
            hasher.update(previous);
        }
        hasher.update(&timestamp.to_be_bytes());
        hasher.update(generator_public_key);
        hasher.update(&total_fee.raw().to_be_bytes());
        hasher.update(&reward.raw().to_be_bytes());
        hasher.update(payload_hash);

        let hash = hasher.finalize();
        let mut id = [0u8; 32];
        id.copy_from_slice(&hash.as_bytes()[0..32]);
        id
    }

    /// Create a new block with the canonical identifier filled in.
    pub fn new(
        height: Height,
        previous_block: Option<BlockId>,
        timestamp: u64,
        generator_public_key: PublicKey,
        total_fee: Satoshi,
        reward: Satoshi,
        payload_hash: [u8; 32],
    ) -> Self {
        let id = Self::compute_id(
            height,
            previous_block.as_ref(),
            timestamp,
            &generator_public_key,
            total_fee,
            reward,
            &payload_hash,
        );

        Self {
            id,
            height,
            previous_block,
            timestamp,
            generator_public_key,
            total_fee,
            reward,
            payload_hash,
            signature: Vec::new(),
        }
    }

    /// The genesis block: height 1, no parent, no fees, no reward.
    pub fn genesis(generator_public_key: PublicKey) -> Self {
        Self::new(
            1,
            None,
            0,
            generator_public_key,
            Satoshi::ZERO,
            Satoshi::ZERO,
            [0u8; 32],
        )
    }
}
