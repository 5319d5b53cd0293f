//! Chain state storage interface and in-memory implementation.
//!
//! Provides the [`ChainStore`] trait for UTXO set management, claimed-address
//! tracking, block storage, and chain tip tracking. The [`MemoryChainStore`]
//! is suitable for testing; the production node uses RocksDB (qc-node).
//!
//! Blocks passed to [`ChainStore::connect_block`] must already be validated.
//! The store only performs minimal sanity checks (height consistency, no
//! duplicate blocks).

use std::collections::{HashMap, HashSet};

use crate::error::{ChainStateError, QcError};
use crate::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, UtxoEntry};
use crate::uint256::Uint256;

/// Bitcoin-style block work for a given target: `floor(2^256 / (target + 1))`.
///
/// Computed without a literal `2^256` (which doesn't fit in 256 bits) via
/// `floor((!target) / (target + 1)) + 1`, where `!target` is the bitwise
/// complement (`2^256 - 1 - target`).
pub fn work_for_target(target: Uint256) -> Uint256 {
    let numerator = target.not();
    let denominator = target.saturating_add(Uint256::ONE);
    numerator.div(denominator).saturating_add(Uint256::ONE)
}

/// Result of connecting a block to the chain state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectBlockResult {
    /// Number of new UTXOs created by this block's transactions.
    pub utxos_created: usize,
    /// Number of UTXOs spent by this block's non-coinbase inputs.
    pub utxos_spent: usize,
    /// Number of Bitcoin addresses newly registered as claimed.
    pub claims_registered: usize,
}

/// Result of disconnecting the tip block from the chain state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisconnectBlockResult {
    /// Number of UTXOs restored (previously spent, now unspent again).
    pub utxos_restored: usize,
    /// Number of UTXOs removed (created by the disconnected block).
    pub utxos_removed: usize,
    /// Number of claimed Bitcoin addresses un-registered.
    pub claims_unregistered: usize,
}

/// Undo data for reverting a connected block.
///
/// Stores the UTXOs consumed by the block's transactions, and the claimed
/// addresses it registered, so both can be restored during reorgs.
#[derive(Clone, Debug)]
struct BlockUndo {
    /// Spent UTXOs in the order they were consumed.
    spent_utxos: Vec<(OutPoint, UtxoEntry)>,
    /// Bitcoin addresses this block registered as claimed.
    claimed_addresses: Vec<String>,
    /// This block's contribution to cumulative work, for reverting on disconnect.
    work: Uint256,
}

/// Mutable chain state storage interface.
///
/// Provides UTXO set management, claimed-address tracking, block storage,
/// and chain tip tracking. Assumes all blocks passed to
/// [`connect_block`](ChainStore::connect_block) have already been validated
/// by the consensus layer.
///
/// Not thread-safe — callers should wrap in a `Mutex` or `RwLock` if
/// concurrent access is needed.
pub trait ChainStore: Send + Sync {
    /// Connect a validated block at the given height.
    ///
    /// Updates the UTXO set (spends inputs, creates outputs), registers any
    /// claimed Bitcoin addresses, stores the block and header, advances the
    /// chain tip, and accumulates work. Stores undo data for later
    /// disconnection.
    ///
    /// # Errors
    ///
    /// - [`ChainStateError::HeightMismatch`] if `height` is not the expected next height
    /// - [`ChainStateError::DuplicateBlock`] if the block hash already exists
    fn connect_block(&mut self, block: &Block, height: u64) -> Result<ConnectBlockResult, QcError>;

    /// Disconnect the current tip block, reverting UTXO, claim-registry, and
    /// cumulative-work changes.
    ///
    /// Uses stored undo data to restore spent UTXOs and remove created
    /// UTXOs. The chain tip moves to the previous block.
    ///
    /// # Errors
    ///
    /// - [`ChainStateError::EmptyChain`] if no blocks are connected
    /// - [`ChainStateError::BlockNotFound`] if the tip block is missing
    /// - [`ChainStateError::UndoDataMissing`] if undo data was not stored
    fn disconnect_tip(&mut self) -> Result<DisconnectBlockResult, QcError>;

    /// Look up a UTXO by outpoint. Returns `None` if spent or unknown.
    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, QcError>;

    /// Check whether a UTXO exists and is unspent.
    ///
    /// Default implementation delegates to [`get_utxo`](Self::get_utxo).
    fn contains_utxo(&self, outpoint: &OutPoint) -> Result<bool, QcError> {
        Ok(self.get_utxo(outpoint)?.is_some())
    }

    /// Whether a Bitcoin address has already redeemed a claim on this chain.
    fn is_btc_address_claimed(&self, btc_address: &str) -> Result<bool, QcError>;

    /// Number of Bitcoin addresses claimed so far on this chain.
    fn claimed_address_count(&self) -> usize;

    /// Current chain tip as `(height, block_hash)`.
    ///
    /// Returns `(0, Hash256::ZERO)` if no blocks have been connected.
    fn chain_tip(&self) -> Result<(u64, Hash256), QcError>;

    /// Total accumulated proof-of-work across the canonical chain.
    ///
    /// Monotonic non-decreasing as blocks connect; used to compare competing
    /// chains during fork-choice.
    fn cumulative_work(&self) -> Uint256;

    /// Get a block header by its hash. Returns `None` if not found.
    fn get_block_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, QcError>;

    /// Get a full block by its hash. Returns `None` if not found.
    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, QcError>;

    /// Get the block hash at a given height. Returns `None` if height exceeds tip.
    fn get_block_hash(&self, height: u64) -> Result<Option<Hash256>, QcError>;

    /// Number of unspent transaction outputs in the set.
    fn utxo_count(&self) -> usize;

    /// Whether no blocks have been connected.
    fn is_empty(&self) -> bool;

    /// Iterate over all UTXOs. Used for balance queries and UTXO scanning.
    /// Default implementation returns empty vec (override for production).
    fn iter_utxos(&self) -> Result<Vec<(OutPoint, UtxoEntry)>, QcError> {
        Ok(Vec::new())
    }

    /// Median timestamp of the `MTP_WINDOW` blocks ending at `tip_hash`
    /// (inclusive), walking `prev_hash` links back from it.
    ///
    /// Used to build [`crate::block_validation::BlockContext`] ahead of
    /// validating a block extending `tip_hash`. Returns `0` if `tip_hash` is
    /// not found (empty chain, i.e. the next block is the genesis block,
    /// which this module never validates).
    fn median_time_past(&self, tip_hash: Hash256) -> Result<u64, QcError> {
        let mut timestamps = Vec::with_capacity(crate::constants::MTP_WINDOW);
        let mut cursor = tip_hash;
        for _ in 0..crate::constants::MTP_WINDOW {
            let Some(header) = self.get_block_header(&cursor)? else {
                break;
            };
            timestamps.push(header.timestamp_ms);
            if header.prev_hash == Hash256::ZERO {
                break;
            }
            cursor = header.prev_hash;
        }
        if timestamps.is_empty() {
            return Ok(0);
        }
        timestamps.sort_unstable();
        Ok(timestamps[timestamps.len() / 2])
    }
}

/// In-memory chain state storage for testing.
///
/// Stores everything in `HashMap`s with no persistence. Not suitable for
/// production use (no crash recovery, unbounded memory growth).
pub struct MemoryChainStore {
    /// UTXO set: outpoint → entry.
    utxos: HashMap<OutPoint, UtxoEntry>,
    /// Bitcoin addresses that have redeemed a claim on this chain.
    claimed_btc_addresses: HashSet<String>,
    /// Full blocks by hash.
    blocks: HashMap<Hash256, Block>,
    /// Block headers by hash.
    headers: HashMap<Hash256, BlockHeader>,
    /// Height → block hash mapping.
    height_to_hash: HashMap<u64, Hash256>,
    /// Undo data by block hash (for disconnect_tip).
    undo_data: HashMap<Hash256, BlockUndo>,
    /// Current tip height.
    tip_height: u64,
    /// Current tip block hash. `Hash256::ZERO` means empty chain.
    tip_hash: Hash256,
    /// Sum of `work_for_target` over every connected block's header.
    cumulative_work: Uint256,
}

impl MemoryChainStore {
    /// Create a new empty chain store.
    pub fn new() -> Self {
        Self {
            utxos: HashMap::new(),
            claimed_btc_addresses: HashSet::new(),
            blocks: HashMap::new(),
            headers: HashMap::new(),
            height_to_hash: HashMap::new(),
            undo_data: HashMap::new(),
            tip_height: 0,
            tip_hash: Hash256::ZERO,
            cumulative_work: Uint256::ZERO,
        }
    }

    /// Number of full blocks stored.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of undo records stored.
    pub fn undo_count(&self) -> usize {
        self.undo_data.len()
    }

    /// Process a transaction's inputs: remove spent UTXOs, record undo data.
    ///
    /// Coinbase and claim transactions are skipped (no real inputs to spend).
    /// Returns the number of UTXOs spent, or an error if a UTXO is missing.
    fn spend_inputs(
        &mut self,
        tx: &Transaction,
        undo: &mut BlockUndo,
    ) -> Result<usize, QcError> {
        if tx.is_coinbase() || tx.is_claim() {
            return Ok(0);
        }
        let mut spent = 0;
        for input in &tx.inputs {
            let entry = self.utxos.remove(&input.previous_output).ok_or_else(|| {
                ChainStateError::MissingUtxo(input.previous_output.to_string())
            })?;
            undo.spent_utxos.push((input.previous_output.clone(), entry));
            spent += 1;
        }
        Ok(spent)
    }

    /// Process a transaction's outputs: create new UTXOs.
    ///
    /// Returns the number of UTXOs created, or an error if txid
    /// computation fails.
    fn create_outputs(
        &mut self,
        tx: &Transaction,
        height: u64,
    ) -> Result<usize, QcError> {
        let txid = tx.txid()?;
        let is_coinbase = tx.is_coinbase();
        let mut created = 0;
        for (index, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint {
                txid,
                index: index as u32,
            };
            let entry = UtxoEntry {
                output: output.clone(),
                block_height: height,
                is_coinbase,
            };
            self.utxos.insert(outpoint, entry);
            created += 1;
        }
        Ok(created)
    }

    /// Register a claim transaction's Bitcoin address as claimed, recording
    /// undo data for reverting on disconnect.
    fn register_claim(&mut self, tx: &Transaction, undo: &mut BlockUndo) -> usize {
        let Some(claim) = &tx.claim else {
            return 0;
        };
        if self.claimed_btc_addresses.insert(claim.btc_address.clone()) {
            undo.claimed_addresses.push(claim.btc_address.clone());
            1
        } else {
            0
        }
    }
}

impl Default for MemoryChainStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainStore for MemoryChainStore {
    fn connect_block(&mut self, block: &Block, height: u64) -> Result<ConnectBlockResult, QcError> {
        // Validate height consistency.
        if self.tip_hash == Hash256::ZERO {
            if height != 0 {
                return Err(ChainStateError::HeightMismatch {
                    expected: 0,
                    got: height,
                }.into());
            }
        } else if height != self.tip_height + 1 {
            return Err(ChainStateError::HeightMismatch {
                expected: self.tip_height + 1,
                got: height,
            }.into());
        }

        let block_hash = block.header.hash();

        // Reject duplicate blocks.
        if self.blocks.contains_key(&block_hash) {
            return Err(ChainStateError::DuplicateBlock(block_hash.to_string()).into());
        }

        let work = work_for_target(block.header.target);
        let mut undo = BlockUndo {
            spent_utxos: Vec::new(),
            claimed_addresses: Vec::new(),
            work,
        };
        let mut total_spent = 0;
        let mut total_created = 0;
        let mut total_claims = 0;

        // Process transactions: spend inputs, create outputs, register claims.
        for tx in &block.transactions {
            total_spent += self.spend_inputs(tx, &mut undo)?;
            total_created += self.create_outputs(tx, height)?;
            total_claims += self.register_claim(tx, &mut undo);
        }

        // Store block, header, height mapping, undo data.
        self.headers.insert(block_hash, block.header.clone());
        self.blocks.insert(block_hash, block.clone());
        self.height_to_hash.insert(height, block_hash);
        self.undo_data.insert(block_hash, undo);

        // Update tip and cumulative work.
        self.tip_height = height;
        self.tip_hash = block_hash;
        self.cumulative_work = self.cumulative_work.saturating_add(work);

        Ok(ConnectBlockResult {
            utxos_created: total_created,
            utxos_spent: total_spent,
            claims_registered: total_claims,
        })
    }

    fn disconnect_tip(&mut self) -> Result<DisconnectBlockResult, QcError> {
        if self.tip_hash == Hash256::ZERO {
            return Err(ChainStateError::EmptyChain.into());
        }

        let tip_hash = self.tip_hash;
        let tip_height = self.tip_height;

        // Get the tip block.
        let block = self.blocks.get(&tip_hash)
            .cloned()
            .ok_or_else(|| ChainStateError::BlockNotFound(tip_hash.to_string()))?;

        // Get undo data.
        let undo = self.undo_data.remove(&tip_hash)
            .ok_or_else(|| ChainStateError::UndoDataMissing(tip_hash.to_string()))?;

        // Remove UTXOs created by this block (reverse transaction order).
        let mut total_removed = 0;
        for tx in block.transactions.iter().rev() {
            let txid = tx.txid()?;
            for (index, _) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint {
                    txid,
                    index: index as u32,
                };
                if self.utxos.remove(&outpoint).is_some() {
                    total_removed += 1;
                }
            }
        }

        // Restore spent UTXOs from undo data.
        let total_restored = undo.spent_utxos.len();
        for (outpoint, entry) in undo.spent_utxos {
            self.utxos.insert(outpoint, entry);
        }

        // Un-register claimed addresses.
        let total_unclaimed = undo.claimed_addresses.len();
        for addr in undo.claimed_addresses {
            self.claimed_btc_addresses.remove(&addr);
        }

        // Remove block from height index.
        self.height_to_hash.remove(&tip_height);

        // Revert cumulative work.
        self.cumulative_work = self.cumulative_work.saturating_sub(undo.work);

        // Update tip.
        if tip_height == 0 {
            // Disconnected genesis — back to empty chain.
            self.tip_height = 0;
            self.tip_hash = Hash256::ZERO;
        } else {
            self.tip_height = tip_height - 1;
            self.tip_hash = block.header.prev_hash;
        }

        Ok(DisconnectBlockResult {
            utxos_restored: total_restored,
            utxos_removed: total_removed,
            claims_unregistered: total_unclaimed,
        })
    }

    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, QcError> {
        Ok(self.utxos.get(outpoint).cloned())
    }

    fn is_btc_address_claimed(&self, btc_address: &str) -> Result<bool, QcError> {
        Ok(self.claimed_btc_addresses.contains(btc_address))
    }

    fn claimed_address_count(&self) -> usize {
        self.claimed_btc_addresses.len()
    }

    fn chain_tip(&self) -> Result<(u64, Hash256), QcError> {
        Ok((self.tip_height, self.tip_hash))
    }

    fn cumulative_work(&self) -> Uint256 {
        self.cumulative_work
    }

    fn get_block_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, QcError> {
        Ok(self.headers.get(hash).cloned())
    }

    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, QcError> {
        Ok(self.blocks.get(hash).cloned())
    }

    fn get_block_hash(&self, height: u64) -> Result<Option<Hash256>, QcError> {
        Ok(self.height_to_hash.get(&height).copied())
    }

    fn utxo_count(&self) -> usize {
        self.utxos.len()
    }

    fn is_empty(&self) -> bool {
        self.tip_hash == Hash256::ZERO
    }
}
