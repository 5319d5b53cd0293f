//! Genesis block definition for QubitCoin.
//!
//! The genesis block is the first block in the chain (height 0). Two kinds
//! exist:
//!
//! - [`GenesisKind::Plain`]: a version-1 header with no Bitcoin snapshot
//!   commitment. Claim transactions are never valid on a plain chain.
//! - [`GenesisKind::ForkSnapshot`]: a version-2 header whose coinbase input
//!   carries a `QCOIN_FORK:height:btcBlockHash:merkleRoot` commitment to the
//!   Bitcoin UTXO snapshot that claim transactions redeem balances from.
//!
//! All values are deterministic for a given [`GenesisKind`] — every node
//! building the same kind computes an identical genesis block.

use std::sync::OnceLock;

use crate::merkle;
use crate::reward;
use crate::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};
use crate::uint256::Uint256;

/// Genesis block timestamp: January 1, 2026 00:00:00 UTC, in milliseconds.
pub const GENESIS_TIMESTAMP_MS: u64 = 1_767_225_600_000;

/// Message embedded in a plain genesis coinbase.
pub const GENESIS_MESSAGE: &[u8] = b"Wealth should flow like water. QubitCoin genesis 2026.";

/// Which kind of genesis block a chain is rooted on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenesisKind {
    /// No Bitcoin snapshot; claim transactions are never valid on this chain.
    Plain,
    /// Commits to a Bitcoin UTXO snapshot taken at `btc_block_hash` (recorded
    /// at Bitcoin block height `height`), whose snapshot data hashes to
    /// `snapshot_merkle_root`. Claim transactions redeem balances recorded
    /// in that snapshot.
    ForkSnapshot {
        height: u64,
        btc_block_hash: Hash256,
        snapshot_merkle_root: Hash256,
    },
}

impl GenesisKind {
    /// The commitment bytes embedded in the genesis coinbase input.
    fn commitment(&self) -> Vec<u8> {
        match self {
            GenesisKind::Plain => GENESIS_MESSAGE.to_vec(),
            GenesisKind::ForkSnapshot {
                height,
                btc_block_hash,
                snapshot_merkle_root,
            } => format!("QCOIN_FORK:{height}:{btc_block_hash}:{snapshot_merkle_root}").into_bytes(),
        }
    }

    fn header_version(&self) -> u32 {
        match self {
            GenesisKind::Plain => 1,
            GenesisKind::ForkSnapshot { .. } => 2,
        }
    }
}

/// The pubkey hash the genesis reward output pays to.
///
/// No one holds the corresponding ML-DSA-65 secret key; the output exists
/// only so `coinbase.outputs.sum() == subsidy(0)` holds at height 0, the
/// same as every other block.
pub fn genesis_reward_pubkey_hash() -> Hash256 {
    Hash256::hash256(b"qubitcoin genesis reward")
}

fn build_genesis_coinbase(kind: &GenesisKind) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature: kind.commitment(),
            public_key: vec![],
        }],
        outputs: vec![TxOutput {
            value: reward::block_reward(0),
            pubkey_hash: genesis_reward_pubkey_hash(),
        }],
        lock_time: 0,
        claim: None,
    }
}

/// Build a genesis block for an arbitrary [`GenesisKind`].
///
/// Unlike [`genesis_block`], this is not cached — callers configuring a
/// [`GenesisKind::ForkSnapshot`] chain should build it once at startup and
/// hold onto the result.
pub fn build(kind: &GenesisKind) -> Block {
    let coinbase = build_genesis_coinbase(kind);
    let coinbase_txid = coinbase
        .txid()
        .expect("genesis coinbase is hardcoded valid data");
    let merkle_root = merkle::merkle_root(&[coinbase_txid]);

    Block {
        header: BlockHeader {
            version: kind.header_version(),
            prev_hash: Hash256::ZERO,
            merkle_root,
            timestamp_ms: GENESIS_TIMESTAMP_MS,
            target: Uint256::MAX,
            nonce: 0,
        },
        transactions: vec![coinbase],
    }
}

struct PlainGenesis {
    block: Block,
    hash: Hash256,
    coinbase_txid: Hash256,
}

static PLAIN_GENESIS: OnceLock<PlainGenesis> = OnceLock::new();

fn plain_genesis() -> &'static PlainGenesis {
    PLAIN_GENESIS.get_or_init(|| {
        let block = build(&GenesisKind::Plain);
        let hash = block.header.hash();
        let coinbase_txid = block.transactions[0]
            .txid()
            .expect("genesis coinbase is hardcoded valid data");
        PlainGenesis {
            block,
            hash,
            coinbase_txid,
        }
    })
}

/// The default (plain) genesis block, used when no Bitcoin snapshot is configured.
pub fn genesis_block() -> &'static Block {
    &plain_genesis().block
}

/// The default (plain) genesis block header hash.
pub fn genesis_hash() -> Hash256 {
    plain_genesis().hash
}

/// The transaction ID of the default (plain) genesis coinbase.
pub fn genesis_coinbase_txid() -> Hash256 {
    plain_genesis().coinbase_txid
}

/// Check whether a block is the default (plain) genesis block by comparing header hashes.
pub fn is_genesis(block: &Block) -> bool {
    block.header.hash() == genesis_hash()
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Plain genesis ---

    #[test]
    fn genesis_timestamp_is_jan_1_2026() {
        assert_eq!(GENESIS_TIMESTAMP_MS, 1_767_225_600_000);
    }

    #[test]
    fn genesis_message_not_empty() {
        assert!(!GENESIS_MESSAGE.is_empty());
        assert!(GENESIS_MESSAGE.starts_with(b"Wealth"));
    }

    #[test]
    fn genesis_block_deterministic() {
        let a = genesis_block();
        let b = genesis_block();
        assert_eq!(a, b);
    }

    #[test]
    fn genesis_block_has_one_transaction() {
        assert_eq!(genesis_block().transactions.len(), 1);
    }

    #[test]
    fn genesis_coinbase_is_coinbase() {
        let block = genesis_block();
        let coinbase = block.coinbase().unwrap();
        assert!(coinbase.is_coinbase());
    }

    #[test]
    fn genesis_coinbase_has_message() {
        let block = genesis_block();
        let coinbase = &block.transactions[0];
        assert_eq!(coinbase.inputs[0].signature, GENESIS_MESSAGE);
    }

    #[test]
    fn genesis_coinbase_pays_block_zero_reward() {
        let block = genesis_block();
        let coinbase = &block.transactions[0];
        assert_eq!(coinbase.outputs.len(), 1);
        assert_eq!(coinbase.outputs[0].value, reward::block_reward(0));
        assert_eq!(
            coinbase.outputs[0].pubkey_hash,
            genesis_reward_pubkey_hash()
        );
    }

    #[test]
    fn genesis_coinbase_total_value() {
        let block = genesis_block();
        let total = block.transactions[0].total_output_value().unwrap();
        assert_eq!(total, reward::block_reward(0));
    }

    // --- Header ---

    #[test]
    fn genesis_header_prev_hash_zero() {
        assert!(genesis_block().header.prev_hash.is_zero());
    }

    #[test]
    fn genesis_header_version_one() {
        assert_eq!(genesis_block().header.version, 1);
    }

    #[test]
    fn genesis_header_timestamp() {
        assert_eq!(genesis_block().header.timestamp_ms, GENESIS_TIMESTAMP_MS);
    }

    #[test]
    fn genesis_header_max_target() {
        assert_eq!(genesis_block().header.target, Uint256::MAX);
    }

    // --- Merkle root ---

    #[test]
    fn genesis_merkle_root_correct() {
        let block = genesis_block();
        let txid = block.transactions[0].txid().unwrap();
        let expected = merkle::merkle_root(&[txid]);
        assert_eq!(block.header.merkle_root, expected);
    }

    #[test]
    fn genesis_merkle_root_nonzero() {
        assert!(!genesis_block().header.merkle_root.is_zero());
    }

    // --- Hash ---

    #[test]
    fn genesis_hash_deterministic() {
        assert_eq!(genesis_hash(), genesis_hash());
    }

    #[test]
    fn genesis_hash_nonzero() {
        assert!(!genesis_hash().is_zero());
    }

    #[test]
    fn genesis_hash_matches_header() {
        assert_eq!(genesis_hash(), genesis_block().header.hash());
    }

    // --- Txid ---

    #[test]
    fn genesis_coinbase_txid_deterministic() {
        assert_eq!(genesis_coinbase_txid(), genesis_coinbase_txid());
    }

    #[test]
    fn genesis_coinbase_txid_matches_computation() {
        let txid = genesis_block().transactions[0].txid().unwrap();
        assert_eq!(genesis_coinbase_txid(), txid);
    }

    // --- is_genesis ---

    #[test]
    fn is_genesis_true_for_genesis() {
        assert!(is_genesis(genesis_block()));
    }

    #[test]
    fn is_genesis_false_for_other_block() {
        let other = Block {
            header: BlockHeader {
                version: 1,
                prev_hash: genesis_hash(),
                merkle_root: Hash256::ZERO,
                timestamp_ms: GENESIS_TIMESTAMP_MS + 30_000,
                target: Uint256::MAX,
                nonce: 0,
            },
            transactions: vec![],
        };
        assert!(!is_genesis(&other));
    }

    #[test]
    fn is_genesis_false_for_modified_genesis() {
        let mut modified = genesis_block().clone();
        modified.header.nonce = 999;
        assert!(!is_genesis(&modified));
    }

    // --- Fork-snapshot genesis ---

    #[test]
    fn fork_snapshot_has_version_two() {
        let kind = GenesisKind::ForkSnapshot {
            height: 900_000,
            btc_block_hash: Hash256([0x11; 32]),
            snapshot_merkle_root: Hash256([0x22; 32]),
        };
        let block = build(&kind);
        assert_eq!(block.header.version, 2);
    }

    #[test]
    fn fork_snapshot_embeds_commitment() {
        let btc_hash = Hash256([0x11; 32]);
        let merkle_root = Hash256([0x22; 32]);
        let kind = GenesisKind::ForkSnapshot {
            height: 900_000,
            btc_block_hash: btc_hash,
            snapshot_merkle_root: merkle_root,
        };
        let block = build(&kind);
        let commitment = &block.transactions[0].inputs[0].signature;
        let text = String::from_utf8(commitment.clone()).unwrap();
        assert!(text.starts_with("QCOIN_FORK:900000:"));
        assert!(text.contains(&btc_hash.to_string()));
        assert!(text.contains(&merkle_root.to_string()));
    }

    #[test]
    fn fork_snapshot_deterministic() {
        let kind = GenesisKind::ForkSnapshot {
            height: 1,
            btc_block_hash: Hash256([0xAA; 32]),
            snapshot_merkle_root: Hash256([0xBB; 32]),
        };
        assert_eq!(build(&kind), build(&kind));
    }

    #[test]
    fn fork_snapshot_differs_from_plain() {
        let kind = GenesisKind::ForkSnapshot {
            height: 1,
            btc_block_hash: Hash256([0xAA; 32]),
            snapshot_merkle_root: Hash256([0xBB; 32]),
        };
        assert_ne!(build(&kind).header.hash(), genesis_hash());
    }

    #[test]
    fn fork_snapshot_pays_block_zero_reward() {
        let kind = GenesisKind::ForkSnapshot {
            height: 1,
            btc_block_hash: Hash256([0xAA; 32]),
            snapshot_merkle_root: Hash256([0xBB; 32]),
        };
        let block = build(&kind);
        assert_eq!(
            block.transactions[0].outputs[0].value,
            reward::block_reward(0)
        );
    }

    // --- Reward pubkey hash ---

    #[test]
    fn genesis_reward_pubkey_hash_deterministic() {
        assert_eq!(genesis_reward_pubkey_hash(), genesis_reward_pubkey_hash());
    }

    #[test]
    fn genesis_reward_pubkey_hash_nonzero() {
        assert!(!genesis_reward_pubkey_hash().is_zero());
    }
}
