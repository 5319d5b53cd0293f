//! Bitcoin UTXO snapshot: the preallocated balances claim transactions redeem.
//!
//! A chain rooted on [`crate::genesis::GenesisKind::ForkSnapshot`] commits to
//! a snapshot's merkle root in its genesis coinbase. The snapshot data itself
//! (every entry) is distributed separately and must hash to that committed
//! root; [`Snapshot::verify_merkle_root`] re-derives it from `entries` the
//! same way [`crate::merkle::merkle_root`] commits transactions to a block.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::merkle;
use crate::types::{BtcAddressType, Hash256};

/// One preallocated balance recorded in the snapshot, keyed by `btc_address`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct SnapshotEntry {
    /// The Bitcoin address the balance was recorded under at snapshot time.
    pub btc_address: String,
    /// The address's script type, used to recompute it from a claim's key material.
    pub address_type: BtcAddressType,
    /// Balance in qsats, minted to the claim's output on success.
    pub amount: u64,
}

impl SnapshotEntry {
    fn leaf_hash(&self) -> Hash256 {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())
            .expect("SnapshotEntry encoding is infallible");
        Hash256::hash256(&encoded)
    }
}

/// A Bitcoin UTXO snapshot taken at a fixed Bitcoin block height, committed
/// to by a [`crate::genesis::GenesisKind::ForkSnapshot`] genesis block.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub btc_block_height: u64,
    pub btc_block_hash: Hash256,
    pub btc_timestamp: u64,
    pub entries: Vec<SnapshotEntry>,
    pub merkle_root: Hash256,
}

impl Snapshot {
    /// Recompute the merkle root over `entries` and compare it to `merkle_root`.
    pub fn verify_merkle_root(&self) -> bool {
        self.recompute_merkle_root() == self.merkle_root
    }

    /// Recompute the merkle root over `entries`, independent of the
    /// `merkle_root` field on this value.
    pub fn recompute_merkle_root(&self) -> Hash256 {
        let leaves: Vec<Hash256> = self.entries.iter().map(SnapshotEntry::leaf_hash).collect();
        merkle::merkle_root(&leaves)
    }

    /// Build a lookup index over `entries` by `btc_address`, for claim validation.
    ///
    /// Does not itself check [`Self::verify_merkle_root`] — callers load a
    /// snapshot through a path that checks it once (e.g. at node startup)
    /// and should not trust an index built from an unverified snapshot.
    pub fn build_index(&self) -> SnapshotIndex {
        SnapshotIndex {
            entries: self
                .entries
                .iter()
                .map(|e| (e.btc_address.clone(), e.clone()))
                .collect(),
        }
    }
}

/// A `btcAddress -> SnapshotEntry` index, used by claim validation to look up
/// the recorded type and amount for a claimed address without scanning the
/// full entry list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotIndex {
    entries: HashMap<String, SnapshotEntry>,
}

impl SnapshotIndex {
    /// An index with no entries. Claims always fail `UnknownSnapshotAddress`
    /// against this — used on chains with no snapshot genesis.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        snapshot.build_index()
    }

    pub fn get(&self, btc_address: &str) -> Option<&SnapshotEntry> {
        self.entries.get(btc_address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
