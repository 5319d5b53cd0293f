//! Loading the Bitcoin UTXO snapshot a fork-snapshot genesis commits to.
//!
//! The snapshot itself (every [`qc_core::snapshot::SnapshotEntry`]) ships as a
//! JSON file alongside the node binary rather than baked into the genesis
//! block; [`load_snapshot`] reads it and checks it against the merkle root
//! the chain actually committed to before any claim is allowed to use it.

use std::path::Path;

use qc_core::snapshot::{Snapshot, SnapshotIndex};
use qc_core::types::Hash256;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotLoadError {
    #[error("reading snapshot file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("parsing snapshot file {path}: {source}")]
    Parse { path: String, source: serde_json::Error },
    #[error("snapshot merkle root does not match its entries")]
    RootMismatch,
    #[error("snapshot btc block hash {got} does not match genesis commitment {expected}")]
    BlockHashMismatch { got: String, expected: String },
}

/// Read a snapshot JSON file, verify its merkle root, and build an index.
///
/// `genesis_btc_block_hash` is the hash the chain's fork-snapshot genesis
/// committed to; the loaded snapshot must match it, so a node can't be
/// pointed at a snapshot for the wrong fork.
pub fn load_snapshot(
    path: impl AsRef<Path>,
    genesis_btc_block_hash: &Hash256,
) -> Result<(Snapshot, SnapshotIndex), SnapshotLoadError> {
    let path = path.as_ref();
    let raw = std::fs::read(path).map_err(|e| SnapshotLoadError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let snapshot: Snapshot = serde_json::from_slice(&raw).map_err(|e| SnapshotLoadError::Parse {
        path: path.display().to_string(),
        source: e,
    })?;

    if !snapshot.verify_merkle_root() {
        return Err(SnapshotLoadError::RootMismatch);
    }
    if &snapshot.btc_block_hash != genesis_btc_block_hash {
        return Err(SnapshotLoadError::BlockHashMismatch {
            got: hex::encode(snapshot.btc_block_hash.0),
            expected: hex::encode(genesis_btc_block_hash.0),
        });
    }

    let index = snapshot.build_index();
    Ok((snapshot, index))
}
