//! RocksDB-backed persistent chain state storage.
//!
//! Implements [`ChainStore`] using RocksDB column families for blocks, headers,
//! UTXOs, height index, undo data, and metadata. All mutations use atomic
//! [`WriteBatch`] for crash safety.
//!
//! On first open, automatically connects the genesis block.

use std::collections::HashMap;
use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, Options, SliceTransform, WriteBatch, DB};

use rill_core::agent::AgentWalletState;
use rill_core::chain_state::{ChainStore, ConnectBlockResult, DisconnectBlockResult};
use rill_core::conduct::{self, VelocityBaseline};
use rill_core::constants::CONDUCT_PERIOD_BLOCKS;
use rill_core::error::{ChainStateError, RillError};
use rill_core::genesis;
use rill_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, UtxoEntry};
use rill_decay::cluster::determine_output_cluster;

// --- Column family names ---

const CF_BLOCKS: &str = "blocks";
const CF_HEADERS: &str = "headers";
const CF_UTXOS: &str = "utxos";
const CF_HEIGHT_INDEX: &str = "height_index";
const CF_UNDO: &str = "undo";
const CF_METADATA: &str = "metadata";
const CF_CLUSTERS: &str = "clusters";
const CF_ADDRESS_INDEX: &str = "address_index";
const CF_AGENT_WALLETS: &str = "agent_wallets";

/// All column family names.
const ALL_CFS: &[&str] = &[
    CF_BLOCKS,
    CF_HEADERS,
    CF_UTXOS,
    CF_HEIGHT_INDEX,
    CF_UNDO,
    CF_METADATA,
    CF_CLUSTERS,
    CF_ADDRESS_INDEX,
    CF_AGENT_WALLETS,
];

// --- Metadata keys ---

const META_TIP_HEIGHT: &[u8] = b"tip_height";
const META_TIP_HASH: &[u8] = b"tip_hash";
const META_CIRCULATING_SUPPLY: &[u8] = b"circulating_supply";
const META_DECAY_POOL_BALANCE: &[u8] = b"decay_pool_balance";
const META_UTXO_COUNT: &[u8] = b"utxo_count";

/// Undo data for reverting a connected block.
///
/// Stores the UTXOs consumed by the block's transactions so they can be
/// restored during chain reorganization.
#[derive(bincode::Encode, bincode::Decode)]
struct BlockUndo {
    /// Spent UTXOs in the order they were consumed.
    spent_utxos: Vec<(OutPoint, UtxoEntry)>,
    /// Cluster balance deltas applied during this block, for reorg reversal.
    cluster_deltas: Vec<(Hash256, i128)>,
}

/// RocksDB-backed persistent chain state storage.
///
/// Stores blocks, headers, UTXOs, height index, undo data, and aggregate
/// metadata in separate column families. All mutations are atomic via
/// [`WriteBatch`].
///
/// On first open, automatically connects the genesis block.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all column families if they don't exist. If the database is
    /// empty (no tip), automatically connects the genesis block.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RillError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                // Configure address index with fixed prefix extractor (32 bytes for pubkey_hash)
                if *name == CF_ADDRESS_INDEX {
                    opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(32));
                }
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| RillError::Storage(e.to_string()))?;

        let mut store = Self { db };

        // Auto-connect genesis if the chain is empty.
        if store.is_empty() {
            let genesis = genesis::genesis_block();
            store.connect_block(genesis, 0)?;
        }

        // Migrate: build address index if empty but UTXOs exist
        store.migrate_address_index()?;

        Ok(store)
    }

    /// Current circulating supply in rills.
    pub fn circulating_supply(&self) -> Result<u64, RillError> {
        self.get_meta_u64(META_CIRCULATING_SUPPLY)
    }

    /// Current decay pool balance in rills.
    pub fn decay_pool_balance(&self) -> Result<u64, RillError> {
        self.get_meta_u64(META_DECAY_POOL_BALANCE)
    }

    /// Cluster balance for a given cluster ID.
    pub fn cluster_balance(&self, cluster_id: &Hash256) -> Result<u64, RillError> {
        let cf = self.cf_handle(CF_CLUSTERS)?;
        match self
            .db
            .get_cf(&cf, cluster_id.as_bytes())
            .map_err(|e| RillError::Storage(e.to_string()))?
        {
            Some(bytes) if bytes.len() == 8 => {
                Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
            }
            Some(_) => Err(RillError::Storage("invalid cluster balance length".into())),
            None => Ok(0),
        }
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), RillError> {
        self.db
            .flush()
            .map_err(|e| RillError::Storage(e.to_string()))
    }

    /// Trigger manual compaction across all column families.
    ///
    /// Compaction merges SSTables, reclaims space from deleted keys, and
    /// improves read performance. Call this during low-activity periods (e.g.
    /// on startup after IBD completes).
    pub fn compact(&self) -> Result<(), RillError> {
        for cf_name in ALL_CFS {
            let cf = self.cf_handle(cf_name)?;
            self.db
                .compact_range_cf(&cf, None::<&[u8]>, None::<&[u8]>);
        }
        Ok(())
    }

    /// Delete full block data for blocks older than `keep_recent` blocks
    /// from the current tip. Headers and undo data are preserved.
    ///
    /// Returns the number of blocks pruned.
    pub fn prune_blocks(&self, keep_recent: u64) -> Result<u64, RillError> {
        let (tip_height, _) = self.chain_tip()?;

        // Calculate the cutoff: blocks at heights 1..=cutoff are eligible for pruning.
        // Height 0 (genesis) is never pruned.
        let cutoff = tip_height.saturating_sub(keep_recent);
        if cutoff == 0 {
            return Ok(0);
        }

        let cf_blocks = self.cf_handle(CF_BLOCKS)?;
        let cf_height = self.cf_handle(CF_HEIGHT_INDEX)?;
        let mut batch = WriteBatch::default();
        let mut pruned_count = 0u64;

        for height in 1..=cutoff {
            // Look up the block hash for this height.
            let hash_bytes = match self
                .db
                .get_cf(&cf_height, Self::height_key(height))
                .map_err(|e| RillError::Storage(e.to_string()))?
            {
                Some(bytes) if bytes.len() == 32 => bytes,
                _ => continue,
            };

            // Only delete from CF_BLOCKS if the data is still present.
            if self
                .db
                .get_cf(&cf_blocks, &hash_bytes)
                .map_err(|e| RillError::Storage(e.to_string()))?
                .is_some()
            {
                batch.delete_cf(cf_blocks, &hash_bytes);
                pruned_count += 1;
            }
        }

        if pruned_count > 0 {
            self.db
                .write(batch)
                .map_err(|e| RillError::Storage(e.to_string()))?;
            tracing::info!("pruned {} full block(s) up to height {}", pruned_count, cutoff);
        }

        Ok(pruned_count)
    }

    /// Returns true if the block at the given height has been pruned
    /// (header exists but full block data does not).
    pub fn is_block_pruned(&self, height: u64) -> Result<bool, RillError> {
        // Look up the block hash from the height index.
        let hash = match self.get_block_hash(height)? {
            Some(h) => h,
            None => return Ok(false), // Height not in chain at all.
        };

        // Header must exist for the block to be considered "pruned" vs "unknown".
        if self.get_block_header(&hash)?.is_none() {
            return Ok(false);
        }

        // Full block data must be absent.
        let cf_blocks = self.cf_handle(CF_BLOCKS)?;
        let has_full_data = self
            .db
            .get_cf(&cf_blocks, hash.as_bytes())
            .map_err(|e| RillError::Storage(e.to_string()))?
            .is_some();

        Ok(!has_full_data)
    }

    // --- Internal helpers ---

    /// Get a u64 from the metadata column family.
    fn get_meta_u64(&self, key: &[u8]) -> Result<u64, RillError> {
        let cf = self.cf_handle(CF_METADATA)?;
        match self
            .db
            .get_cf(&cf, key)
            .map_err(|e| RillError::Storage(e.to_string()))?
        {
            Some(bytes) if bytes.len() == 8 => {
                Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
            }
            Some(_) => Err(RillError::Storage("invalid metadata value length".into())),
            None => Ok(0),
        }
    }

    /// Get a column family handle.
    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, RillError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| RillError::Storage(format!("missing column family: {name}")))
    }

    /// Encode an OutPoint as a bincode key.
    fn encode_outpoint(outpoint: &OutPoint) -> Result<Vec<u8>, RillError> {
        bincode::encode_to_vec(outpoint, bincode::config::standard())
            .map_err(|e| RillError::Storage(e.to_string()))
    }

    /// Encode a height as big-endian bytes for ordered iteration.
    fn height_key(height: u64) -> [u8; 8] {
        height.to_be_bytes()
    }

    /// Encode an address index key: pubkey_hash || txid || index(BE).
    fn encode_address_index_key(pubkey_hash: &Hash256, outpoint: &OutPoint) -> [u8; 72] {
        let mut key = [0u8; 72];
        key[0..32].copy_from_slice(pubkey_hash.as_bytes());
        key[32..64].copy_from_slice(outpoint.txid.as_bytes());
        key[64..72].copy_from_slice(&outpoint.index.to_be_bytes());
        key
    }

    /// Compute the total coinbase output value for a block.
    fn coinbase_value(block: &Block) -> u64 {
        block
            .coinbase()
            .map(|cb| cb.outputs.iter().map(|o| o.value).sum())
            .unwrap_or(0)
    }

    /// Process a transaction's inputs: mark outpoints for deletion, collect undo data.
    ///
    /// Returns the number of UTXOs spent.
    fn collect_spent_utxos(
        &self,
        tx: &Transaction,
        undo: &mut BlockUndo,
    ) -> Result<usize, RillError> {
        if tx.is_coinbase() {
            return Ok(0);
        }

        let cf_utxos = self.cf_handle(CF_UTXOS)?;
        let mut spent = 0;

        for input in &tx.inputs {
            let key = Self::encode_outpoint(&input.previous_output)?;
            if let Some(data) = self
                .db
                .get_cf(&cf_utxos, &key)
                .map_err(|e| RillError::Storage(e.to_string()))?
            {
                let (entry, _): (UtxoEntry, _) =
                    bincode::decode_from_slice(&data, bincode::config::standard())
                        .map_err(|e| RillError::Storage(e.to_string()))?;
                undo.spent_utxos
                    .push((input.previous_output.clone(), entry));
                spent += 1;
            }
        }

        Ok(spent)
    }

    /// One-time migration: build address index from existing UTXOs.
    fn migrate_address_index(&self) -> Result<(), RillError> {
        let cf_addr = self.cf_handle(CF_ADDRESS_INDEX)?;

        // Check if index already has entries
        let mut iter = self.db.iterator_cf(&cf_addr, rocksdb::IteratorMode::Start);
        if iter.next().is_some() {
            return Ok(()); // Already populated
        }
        drop(iter);

        // Check if there are UTXOs to index
        let utxo_count = self.get_meta_u64(META_UTXO_COUNT)?;
        if utxo_count == 0 {
            return Ok(());
        }

        tracing::info!("migrating address index for {} UTXOs", utxo_count);

        let cf_utxos = self.cf_handle(CF_UTXOS)?;
        let mut batch = WriteBatch::default();
        let mut count = 0u64;

        let iter = self.db.iterator_cf(&cf_utxos, rocksdb::IteratorMode::Start);
        for item in iter {
            let (key_bytes, value_bytes) = item.map_err(|e| RillError::Storage(e.to_string()))?;
            let (outpoint, _): (OutPoint, _) =
                bincode::decode_from_slice(&key_bytes, bincode::config::standard())
                    .map_err(|e| RillError::Storage(e.to_string()))?;
            let (entry, _): (UtxoEntry, _) =
                bincode::decode_from_slice(&value_bytes, bincode::config::standard())
                    .map_err(|e| RillError::Storage(e.to_string()))?;

            let addr_key = Self::encode_address_index_key(&entry.output.pubkey_hash, &outpoint);
            batch.put_cf(cf_addr, addr_key, []);
            count += 1;
        }

        if count > 0 {
            self.db.write(batch).map_err(|e| RillError::Storage(e.to_string()))?;
            tracing::info!("address index migration complete: {} entries", count);
        }

        Ok(())
    }

    /// Get all UTXOs for a given pubkey hash using the address index.
    ///
    /// Uses RocksDB prefix iteration over CF_ADDRESS_INDEX for O(k) lookup
    /// where k is the number of UTXOs owned by this address.
    pub fn get_utxos_by_address(
        &self,
        pubkey_hash: &Hash256,
    ) -> Result<Vec<(OutPoint, UtxoEntry)>, RillError> {
        let cf_addr = self.cf_handle(CF_ADDRESS_INDEX)?;
        let cf_utxos = self.cf_handle(CF_UTXOS)?;
        let prefix = pubkey_hash.as_bytes();

        let mut result = Vec::new();
        let iter = self.db.prefix_iterator_cf(&cf_addr, prefix);

        for item in iter {
            let (key_bytes, _) = item.map_err(|e| RillError::Storage(e.to_string()))?;

            // Verify the prefix still matches (prefix_iterator may overshoot)
            if key_bytes.len() != 72 || &key_bytes[0..32] != prefix {
                break;
            }

            // Extract outpoint from key
            let mut txid_bytes = [0u8; 32];
            txid_bytes.copy_from_slice(&key_bytes[32..64]);
            let index = u64::from_be_bytes(key_bytes[64..72].try_into().unwrap());
            let outpoint = OutPoint {
                txid: Hash256(txid_bytes),
                index,
            };

            // Look up the actual UTXO entry
            let utxo_key = Self::encode_outpoint(&outpoint)?;
            if let Some(utxo_data) = self.db.get_cf(&cf_utxos, &utxo_key)
                .map_err(|e| RillError::Storage(e.to_string()))?
            {
                let (entry, _): (UtxoEntry, _) =
                    bincode::decode_from_slice(&utxo_data, bincode::config::standard())
                        .map_err(|e| RillError::Storage(e.to_string()))?;
                result.push((outpoint, entry));
            }
        }

        Ok(result)
    }

    /// Look up an agent wallet state by pubkey hash.
    pub fn get_agent_wallet(&self, pubkey_hash: &Hash256) -> Result<Option<AgentWalletState>, RillError> {
        let cf = self.cf_handle(CF_AGENT_WALLETS)?;
        match self.db.get_cf(&cf, pubkey_hash.as_bytes())
            .map_err(|e| RillError::Storage(e.to_string()))?
        {
            Some(bytes) => {
                let (state, _): (AgentWalletState, _) =
                    bincode::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| RillError::Storage(e.to_string()))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Store an agent wallet state.
    pub fn put_agent_wallet(&self, state: &AgentWalletState) -> Result<(), RillError> {
        let cf = self.cf_handle(CF_AGENT_WALLETS)?;
        let bytes = bincode::encode_to_vec(state, bincode::config::standard())
            .map_err(|e| RillError::Storage(e.to_string()))?;
        self.db.put_cf(&cf, state.pubkey_hash.as_bytes(), &bytes)
            .map_err(|e| RillError::Storage(e.to_string()))
    }

    /// Check if a pubkey hash is registered as an agent wallet.
    pub fn is_agent_wallet(&self, pubkey_hash: &Hash256) -> Result<bool, RillError> {
        let cf = self.cf_handle(CF_AGENT_WALLETS)?;
        self.db.get_cf(&cf, pubkey_hash.as_bytes())
            .map(|v| v.is_some())
            .map_err(|e| RillError::Storage(e.to_string()))
    }

    /// Process conduct score updates at epoch boundaries.
    ///
    /// Called during `connect_block` when `height` is a non-zero multiple of
    /// [`CONDUCT_PERIOD_BLOCKS`]. Iterates all registered agent wallets,
    /// updates each wallet's velocity baseline with the epoch's outbound
    /// volume, recomputes the conduct score via exponential smoothing, and
    /// derives the updated decay multiplier.
    ///
    /// All updates are written into `batch` for atomic commit alongside the
    /// rest of the block.
    fn process_conduct_epoch(
        &self,
        batch: &mut WriteBatch,
        height: u64,
        agent_epoch_volumes: &HashMap<Hash256, u64>,
    ) -> Result<(), RillError> {
        let cf_agents = self.cf_handle(CF_AGENT_WALLETS)?;

        // Collect all agent wallet states first to avoid holding the iterator
        // while we also need to call self methods.
        let mut agents: Vec<AgentWalletState> = Vec::new();
        {
            let iter = self
                .db
                .iterator_cf(&cf_agents, rocksdb::IteratorMode::Start);
            for item in iter {
                let (_, value_bytes) =
                    item.map_err(|e| RillError::Storage(e.to_string()))?;
                let (state, _): (AgentWalletState, _) =
                    bincode::decode_from_slice(&value_bytes, bincode::config::standard())
                        .map_err(|e| RillError::Storage(e.to_string()))?;
                agents.push(state);
            }
        }

        for mut state in agents {
            // Get the outbound volume for this agent during the epoch (0 if none).
            let epoch_volume = agent_epoch_volumes
                .get(&state.pubkey_hash)
                .copied()
                .unwrap_or(0);

            // Push the new epoch volume into the rolling baseline.
            state.velocity_baseline.push_epoch(epoch_volume);

            // Compute wallet age in epochs.
            let age_in_epochs = (height.saturating_sub(state.registered_at_block))
                / CONDUCT_PERIOD_BLOCKS;

            // Compute individual signal scores.
            let velocity_anomaly =
                conduct::velocity_anomaly_score(&state.velocity_baseline, epoch_volume);
            let wallet_age = conduct::wallet_age_score(age_in_epochs);

            // Compute raw score (neutral 500 for signals not yet implemented).
            let raw_score =
                conduct::compute_raw_score(500, 500, velocity_anomaly, 500, wallet_age);

            // Apply exponential smoothing to avoid sudden score jumps.
            let new_score = conduct::smooth_score(state.conduct_score, raw_score);

            // Derive the updated decay multiplier from the new score.
            let new_multiplier_bps = conduct::score_to_multiplier_bps(new_score);

            tracing::debug!(
                pubkey_hash = %state.pubkey_hash,
                height,
                epoch_volume,
                velocity_anomaly,
                wallet_age,
                raw_score,
                old_score = state.conduct_score,
                new_score,
                new_multiplier_bps,
                "conduct epoch update"
            );

            state.conduct_score = new_score;
            state.conduct_multiplier_bps = new_multiplier_bps;

            let state_bytes =
                bincode::encode_to_vec(&state, bincode::config::standard())
                    .map_err(|e| RillError::Storage(e.to_string()))?;
            batch.put_cf(cf_agents, state.pubkey_hash.as_bytes(), &state_bytes);
        }

        Ok(())
    }

    /// Get a geometric block locator for chain synchronization.
    ///
    /// Returns hashes in the pattern: tip, tip-1, tip-2, tip-4, tip-8, ..., genesis.
    /// This allows efficient common ancestor discovery with O(log n) hashes.
    pub fn get_block_locator(&self) -> Result<Vec<Hash256>, RillError> {
        let (tip_height, tip_hash) = self.chain_tip()?;
        if tip_hash == Hash256::ZERO {
            return Ok(vec![Hash256::ZERO]);
        }

        let mut locator = Vec::new();
        let mut step = 1u64;
        let mut height = tip_height;

        loop {
            if let Some(hash) = self.get_block_hash(height)? {
                locator.push(hash);
            }

            if height == 0 {
                break;
            }

            // Geometric backoff: 1, 1, 2, 4, 8, 16, ...
            if height <= step {
                height = 0;
            } else {
                height -= step;
            }

            // Double the step after the first few blocks.
            if locator.len() > 10 {
                step *= 2;
            }
        }

        // Always include genesis if not already present.
        if locator.last() != Some(&Hash256::ZERO) {
            if let Some(genesis_hash) = self.get_block_hash(0)? {
                if !locator.contains(&genesis_hash) {
                    locator.push(genesis_hash);
                }
            }
        }

        Ok(locator)
    }

    /// Look up the height at which a given hash appears in the height index.
    ///
    /// Iterates the height index from the most-recent end backwards, since
    /// recent blocks are the common case for locator and header-sync queries.
    /// Returns `None` if the hash is not in the main chain.
    fn get_height_for_hash(&self, hash: &Hash256) -> Result<Option<u64>, RillError> {
        let cf_height = self.cf_handle(CF_HEIGHT_INDEX)?;
        let iter = self
            .db
            .iterator_cf(&cf_height, rocksdb::IteratorMode::End);
        for item in iter {
            let (key_bytes, value_bytes) =
                item.map_err(|e| RillError::Storage(e.to_string()))?;
            if value_bytes.len() == 32 {
                let stored_hash = Hash256(value_bytes[..32].try_into().unwrap());
                if stored_hash == *hash && key_bytes.len() == 8 {
                    let height =
                        u64::from_be_bytes(key_bytes[..8].try_into().unwrap());
                    return Ok(Some(height));
                }
            }
        }
        Ok(None)
    }

    /// Find the first locator hash that we have in our chain.
    ///
    /// Returns (height, hash) of the common ancestor, or None if no match.
    /// Uses the height index for O(chain_length) worst-case instead of
    /// O(locator_len * chain_length).
    pub fn find_common_ancestor(
        &self,
        locator: &[Hash256],
    ) -> Result<Option<(u64, Hash256)>, RillError> {
        for hash in locator {
            // Check if we have this block header at all.
            if self.get_block_header(hash)?.is_none() {
                continue;
            }
            // Scan the height index (newest-first) to find it on our main chain.
            if let Some(height) = self.get_height_for_hash(hash)? {
                return Ok(Some((height, *hash)));
            }
            // We have the block but it is not on our main chain (stale/orphan).
            // Keep looking for a deeper common ancestor.
        }

        Ok(None)
    }

    /// Get up to `max_count` headers after the given hash.
    ///
    /// Caps at 2000 headers maximum per request. Uses the height index for an
    /// O(result_count) scan rather than O(chain_length).
    pub fn get_headers_after(
        &self,
        hash: &Hash256,
        max_count: usize,
    ) -> Result<Vec<BlockHeader>, RillError> {
        const MAX_HEADERS_PER_REQUEST: usize = 2000;
        let limit = max_count.min(MAX_HEADERS_PER_REQUEST);

        // Find the height of the starting hash via the height index.
        let start_height = match self.get_height_for_hash(hash)? {
            Some(h) => h,
            None => return Ok(vec![]), // Unknown hash, return empty.
        };

        let cf_height = self.cf_handle(CF_HEIGHT_INDEX)?;
        let mut headers = Vec::new();

        // Seek to the first height after `start_height` and iterate forward.
        let start_key = Self::height_key(start_height + 1);
        let iter = self.db.iterator_cf(
            &cf_height,
            rocksdb::IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            if headers.len() >= limit {
                break;
            }
            let (_, value_bytes) = item.map_err(|e| RillError::Storage(e.to_string()))?;
            if value_bytes.len() == 32 {
                let h = Hash256(value_bytes[..32].try_into().unwrap());
                if let Some(header) = self.get_block_header(&h)? {
                    headers.push(header);
                }
            }
        }

        Ok(headers)
    }
}

impl ChainStore for RocksStore {
    fn connect_block(
        &mut self,
        block: &Block,
        height: u64,
    ) -> Result<ConnectBlockResult, RillError> {
        // Validate height consistency.
        let (tip_height, tip_hash) = self.chain_tip()?;
        if tip_hash == Hash256::ZERO {
            if height != 0 {
                return Err(ChainStateError::HeightMismatch {
                    expected: 0,
                    got: height,
                }
                .into());
            }
        } else if height != tip_height + 1 {
            return Err(ChainStateError::HeightMismatch {
                expected: tip_height + 1,
                got: height,
            }
            .into());
        }

        let block_hash = block.header.hash();

        // Reject duplicate blocks.
        let cf_blocks = self.cf_handle(CF_BLOCKS)?;
        if self
            .db
            .get_cf(&cf_blocks, block_hash.as_bytes())
            .map_err(|e| RillError::Storage(e.to_string()))?
            .is_some()
        {
            return Err(ChainStateError::DuplicateBlock(block_hash.to_string()).into());
        }

        // Collect spent UTXOs for undo data.
        let mut undo = BlockUndo {
            spent_utxos: Vec::new(),
            cluster_deltas: Vec::new(),
        };
        let mut total_spent = 0;
        for tx in &block.transactions {
            total_spent += self.collect_spent_utxos(tx, &mut undo)?;
        }

        // Build an atomic WriteBatch.
        let mut batch = WriteBatch::default();

        let cf_blocks = self.cf_handle(CF_BLOCKS)?;
        let cf_headers = self.cf_handle(CF_HEADERS)?;
        let cf_utxos = self.cf_handle(CF_UTXOS)?;
        let cf_height = self.cf_handle(CF_HEIGHT_INDEX)?;
        let cf_undo = self.cf_handle(CF_UNDO)?;
        let cf_meta = self.cf_handle(CF_METADATA)?;
        let cf_addr_index = self.cf_handle(CF_ADDRESS_INDEX)?;

        // Track cluster balance deltas.
        let mut cluster_deltas: HashMap<Hash256, i128> = HashMap::new();

        // Track outbound volumes per agent wallet for conduct epoch processing.
        let mut agent_epoch_volumes: HashMap<Hash256, u64> = HashMap::new();

        // Delete spent UTXOs and subtract their values from cluster balances.
        for (outpoint, entry) in &undo.spent_utxos {
            let key = Self::encode_outpoint(outpoint)?;
            batch.delete_cf(cf_utxos, &key);

            // Delete address index entry
            let addr_key = Self::encode_address_index_key(&entry.output.pubkey_hash, outpoint);
            batch.delete_cf(cf_addr_index, addr_key);

            // Subtract spent UTXO value from its cluster.
            let delta = cluster_deltas.entry(entry.cluster_id).or_insert(0);
            *delta -= entry.output.value as i128;

            // Accumulate outbound volume for agent wallets.
            if self.is_agent_wallet(&entry.output.pubkey_hash)? {
                let vol = agent_epoch_volumes
                    .entry(entry.output.pubkey_hash)
                    .or_insert(0);
                *vol = vol.saturating_add(entry.output.value);
            }
        }

        // Create new UTXOs with proper cluster tracking.
        let cf_clusters = self.cf_handle(CF_CLUSTERS)?;
        let mut total_created = 0u64;
        for tx in &block.transactions {
            let txid = tx.txid().map_err(RillError::from)?;
            let is_coinbase = tx.is_coinbase();

            // Determine input cluster IDs for this transaction.
            let input_cluster_ids: Vec<Hash256> = if is_coinbase {
                Vec::new()
            } else {
                tx.inputs
                    .iter()
                    .filter_map(|input| {
                        undo.spent_utxos
                            .iter()
                            .find(|(op, _)| op == &input.previous_output)
                            .map(|(_, entry)| entry.cluster_id)
                    })
                    .collect()
            };

            // Determine the output cluster ID for this transaction.
            let output_cluster_id = determine_output_cluster(&input_cluster_ids, &txid);

            // Create UTXOs with the determined cluster ID.
            for (index, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint {
                    txid,
                    index: index as u64,
                };
                let entry = UtxoEntry {
                    output: output.clone(),
                    block_height: height,
                    is_coinbase,
                    cluster_id: output_cluster_id,
                };
                let key = Self::encode_outpoint(&outpoint)?;
                let value = bincode::encode_to_vec(&entry, bincode::config::standard())
                    .map_err(|e| RillError::Storage(e.to_string()))?;
                batch.put_cf(cf_utxos, &key, &value);
                total_created += 1;

                // Add address index entry
                let addr_key = Self::encode_address_index_key(&output.pubkey_hash, &outpoint);
                batch.put_cf(cf_addr_index, addr_key, []);

                // Add created UTXO value to its cluster.
                let delta = cluster_deltas.entry(output_cluster_id).or_insert(0);
                *delta += output.value as i128;
            }
        }

        // Process AgentRegister transactions.
        let cf_agents = self.cf_handle(CF_AGENT_WALLETS)?;
        for tx in &block.transactions {
            if tx.tx_type == rill_core::types::TxType::AgentRegister {
                // The first output's pubkey_hash is the registrant.
                if let Some(first_output) = tx.outputs.first() {
                    if first_output.value >= rill_core::constants::AGENT_REGISTRATION_STAKE {
                        // Check not already registered.
                        if !self.is_agent_wallet(&first_output.pubkey_hash)? {
                            let state = AgentWalletState {
                                pubkey_hash: first_output.pubkey_hash,
                                registered_at_block: height,
                                stake_balance: first_output.value,
                                stake_locked_until: height + rill_core::constants::CONDUCT_PERIOD_BLOCKS,
                                conduct_score: rill_core::constants::CONDUCT_SCORE_DEFAULT,
                                conduct_multiplier_bps: rill_core::constants::CONDUCT_MULTIPLIER_DEFAULT_BPS,
                                undertow_active: false,
                                undertow_expires_at: 0,
                                velocity_baseline: VelocityBaseline::new(),
                            };
                            let state_bytes = bincode::encode_to_vec(&state, bincode::config::standard())
                                .map_err(|e| RillError::Storage(e.to_string()))?;
                            batch.put_cf(cf_agents, state.pubkey_hash.as_bytes(), &state_bytes);
                        }
                    }
                }
            }
        }

        // Apply cluster balance deltas.
        for (cluster_id, delta) in &cluster_deltas {
            let current_balance = self.cluster_balance(cluster_id)?;
            let new_balance = if *delta >= 0 {
                current_balance
                    .checked_add(*delta as u64)
                    .ok_or_else(|| RillError::Storage("cluster balance overflow".into()))?
            } else {
                current_balance
                    .checked_sub((-*delta) as u64)
                    .ok_or_else(|| RillError::Storage("cluster balance underflow".into()))?
            };

            if new_balance == 0 {
                batch.delete_cf(cf_clusters, cluster_id.as_bytes());
            } else {
                batch.put_cf(cf_clusters, cluster_id.as_bytes(), new_balance.to_le_bytes());
            }
        }

        // Store cluster deltas in undo data.
        undo.cluster_deltas = cluster_deltas.into_iter().collect();

        // Store block and header.
        let block_bytes = bincode::encode_to_vec(block, bincode::config::standard())
            .map_err(|e| RillError::Storage(e.to_string()))?;
        let header_bytes =
            bincode::encode_to_vec(&block.header, bincode::config::standard())
                .map_err(|e| RillError::Storage(e.to_string()))?;
        batch.put_cf(cf_blocks, block_hash.as_bytes(), &block_bytes);
        batch.put_cf(cf_headers, block_hash.as_bytes(), &header_bytes);

        // Height index.
        batch.put_cf(cf_height, Self::height_key(height), block_hash.as_bytes());

        // Undo data.
        let undo_bytes = bincode::encode_to_vec(&undo, bincode::config::standard())
            .map_err(|e| RillError::Storage(e.to_string()))?;
        batch.put_cf(cf_undo, block_hash.as_bytes(), &undo_bytes);

        // Update metadata.
        batch.put_cf(cf_meta, META_TIP_HEIGHT, height.to_le_bytes());
        batch.put_cf(cf_meta, META_TIP_HASH, block_hash.as_bytes());

        // Update UTXO count.
        let current_utxo_count = self.get_meta_u64(META_UTXO_COUNT)?;
        let new_utxo_count = current_utxo_count + total_created - total_spent as u64;
        batch.put_cf(cf_meta, META_UTXO_COUNT, new_utxo_count.to_le_bytes());

        // Update circulating supply: add coinbase value.
        let current_supply = self.get_meta_u64(META_CIRCULATING_SUPPLY)?;
        let coinbase_val = Self::coinbase_value(block);
        let new_supply = current_supply.saturating_add(coinbase_val);
        batch.put_cf(
            cf_meta,
            META_CIRCULATING_SUPPLY,
            new_supply.to_le_bytes(),
        );

        // Process conduct score epoch at boundaries (skip genesis block 0).
        if height > 0 && height % CONDUCT_PERIOD_BLOCKS == 0 {
            self.process_conduct_epoch(&mut batch, height, &agent_epoch_volumes)?;
        }

        // Write atomically.
        self.db
            .write(batch)
            .map_err(|e| RillError::Storage(e.to_string()))?;

        Ok(ConnectBlockResult {
            utxos_created: total_created as usize,
            utxos_spent: total_spent,
        })
    }

    fn disconnect_tip(&mut self) -> Result<DisconnectBlockResult, RillError> {
        let (tip_height, tip_hash) = self.chain_tip()?;
        if tip_hash == Hash256::ZERO {
            return Err(ChainStateError::EmptyChain.into());
        }

        // Get the tip block.
        let block = self
            .get_block(&tip_hash)?
            .ok_or_else(|| ChainStateError::BlockNotFound(tip_hash.to_string()))?;

        // Get undo data.
        let cf_undo = self.cf_handle(CF_UNDO)?;
        let undo_bytes = self
            .db
            .get_cf(&cf_undo, tip_hash.as_bytes())
            .map_err(|e| RillError::Storage(e.to_string()))?
            .ok_or_else(|| ChainStateError::UndoDataMissing(tip_hash.to_string()))?;
        let (undo, _): (BlockUndo, _) =
            bincode::decode_from_slice(&undo_bytes, bincode::config::standard())
                .map_err(|e| RillError::Storage(e.to_string()))?;

        let mut batch = WriteBatch::default();

        let cf_utxos = self.cf_handle(CF_UTXOS)?;
        let cf_height = self.cf_handle(CF_HEIGHT_INDEX)?;
        let cf_undo = self.cf_handle(CF_UNDO)?;
        let cf_meta = self.cf_handle(CF_METADATA)?;
        let cf_addr_index = self.cf_handle(CF_ADDRESS_INDEX)?;

        // Remove UTXOs created by this block.
        let mut total_removed = 0u64;
        for tx in block.transactions.iter().rev() {
            let txid = tx.txid().map_err(RillError::from)?;
            for (index, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint {
                    txid,
                    index: index as u64,
                };
                let key = Self::encode_outpoint(&outpoint)?;
                // Check if it exists before counting.
                if self
                    .db
                    .get_cf(&cf_utxos, &key)
                    .map_err(|e| RillError::Storage(e.to_string()))?
                    .is_some()
                {
                    batch.delete_cf(cf_utxos, &key);

                    // Delete address index entry
                    let addr_key = Self::encode_address_index_key(&output.pubkey_hash, &outpoint);
                    batch.delete_cf(cf_addr_index, addr_key);

                    total_removed += 1;
                }
            }
        }

        // Restore spent UTXOs from undo data.
        let total_restored = undo.spent_utxos.len();
        for (outpoint, entry) in &undo.spent_utxos {
            let key = Self::encode_outpoint(outpoint)?;
            let value = bincode::encode_to_vec(entry, bincode::config::standard())
                .map_err(|e| RillError::Storage(e.to_string()))?;
            batch.put_cf(cf_utxos, &key, &value);

            // Restore address index entry
            let addr_key = Self::encode_address_index_key(&entry.output.pubkey_hash, outpoint);
            batch.put_cf(cf_addr_index, addr_key, []);
        }

        // Reverse cluster balance deltas.
        let cf_clusters = self.cf_handle(CF_CLUSTERS)?;
        for (cluster_id, delta) in &undo.cluster_deltas {
            let current_balance = self.cluster_balance(cluster_id)?;
            let new_balance = if *delta >= 0 {
                // Original delta was positive, so subtract it now.
                current_balance
                    .checked_sub(*delta as u64)
                    .ok_or_else(|| RillError::Storage("cluster balance underflow on disconnect".into()))?
            } else {
                // Original delta was negative, so add it back now.
                current_balance
                    .checked_add((-*delta) as u64)
                    .ok_or_else(|| RillError::Storage("cluster balance overflow on disconnect".into()))?
            };

            if new_balance == 0 {
                batch.delete_cf(cf_clusters, cluster_id.as_bytes());
            } else {
                batch.put_cf(cf_clusters, cluster_id.as_bytes(), new_balance.to_le_bytes());
            }
        }

        // Remove undo data and height index entry.
        batch.delete_cf(cf_undo, tip_hash.as_bytes());
        batch.delete_cf(cf_height, Self::height_key(tip_height));

        // Update tip metadata.
        if tip_height == 0 {
            // Disconnected genesis — back to empty chain.
            batch.put_cf(cf_meta, META_TIP_HEIGHT, 0u64.to_le_bytes());
            batch.put_cf(cf_meta, META_TIP_HASH, Hash256::ZERO.as_bytes());
        } else {
            batch.put_cf(
                cf_meta,
                META_TIP_HEIGHT,
                (tip_height - 1).to_le_bytes(),
            );
            batch.put_cf(
                cf_meta,
                META_TIP_HASH,
                block.header.prev_hash.as_bytes(),
            );
        }

        // Update UTXO count.
        let current_utxo_count = self.get_meta_u64(META_UTXO_COUNT)?;
        let new_utxo_count =
            current_utxo_count + total_restored as u64 - total_removed;
        batch.put_cf(cf_meta, META_UTXO_COUNT, new_utxo_count.to_le_bytes());

        // Update circulating supply: subtract coinbase value.
        let current_supply = self.get_meta_u64(META_CIRCULATING_SUPPLY)?;
        let coinbase_val = Self::coinbase_value(&block);
        let new_supply = current_supply.saturating_sub(coinbase_val);
        batch.put_cf(
            cf_meta,
            META_CIRCULATING_SUPPLY,
            new_supply.to_le_bytes(),
        );

        // Write atomically.
        self.db
            .write(batch)
            .map_err(|e| RillError::Storage(e.to_string()))?;

        Ok(DisconnectBlockResult {
            utxos_restored: total_restored,
            utxos_removed: total_removed as usize,
        })
    }

    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, RillError> {
        let cf = self.cf_handle(CF_UTXOS)?;
        let key = Self::encode_outpoint(outpoint)?;
        match self
            .db
            .get_cf(&cf, &key)
            .map_err(|e| RillError::Storage(e.to_string()))?
        {
            Some(data) => {
                let (entry, _): (UtxoEntry, _) =
                    bincode::decode_from_slice(&data, bincode::config::standard())
                        .map_err(|e| RillError::Storage(e.to_string()))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn chain_tip(&self) -> Result<(u64, Hash256), RillError> {
        let cf = self.cf_handle(CF_METADATA)?;
        let hash = match self
            .db
            .get_cf(&cf, META_TIP_HASH)
            .map_err(|e| RillError::Storage(e.to_string()))?
        {
            Some(bytes) if bytes.len() == 32 => {
                Hash256(bytes.try_into().unwrap())
            }
            _ => return Ok((0, Hash256::ZERO)),
        };

        if hash == Hash256::ZERO {
            return Ok((0, Hash256::ZERO));
        }

        let height = self.get_meta_u64(META_TIP_HEIGHT)?;
        Ok((height, hash))
    }

    fn get_block_header(
        &self,
        hash: &Hash256,
    ) -> Result<Option<BlockHeader>, RillError> {
        let cf = self.cf_handle(CF_HEADERS)?;
        match self
            .db
            .get_cf(&cf, hash.as_bytes())
            .map_err(|e| RillError::Storage(e.to_string()))?
        {
            Some(data) => {
                let (header, _): (BlockHeader, _) =
                    bincode::decode_from_slice(&data, bincode::config::standard())
                        .map_err(|e| RillError::Storage(e.to_string()))?;
                Ok(Some(header))
            }
            None => Ok(None),
        }
    }

    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, RillError> {
        let cf = self.cf_handle(CF_BLOCKS)?;
        match self
            .db
            .get_cf(&cf, hash.as_bytes())
            .map_err(|e| RillError::Storage(e.to_string()))?
        {
            Some(data) => {
                let (block, _): (Block, _) =
                    bincode::decode_from_slice(&data, bincode::config::standard())
                        .map_err(|e| RillError::Storage(e.to_string()))?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    fn get_block_hash(&self, height: u64) -> Result<Option<Hash256>, RillError> {
        let cf = self.cf_handle(CF_HEIGHT_INDEX)?;
        match self
            .db
            .get_cf(&cf, Self::height_key(height))
            .map_err(|e| RillError::Storage(e.to_string()))?
        {
            Some(bytes) if bytes.len() == 32 => {
                Ok(Some(Hash256(bytes.try_into().unwrap())))
            }
            _ => Ok(None),
        }
    }

    fn utxo_count(&self) -> usize {
        self.get_meta_u64(META_UTXO_COUNT).unwrap_or(0) as usize
    }

    fn is_empty(&self) -> bool {
        match self.chain_tip() {
            Ok((_, hash)) => hash == Hash256::ZERO,
            Err(_) => true,
        }
    }

    fn iter_utxos(&self) -> Result<Vec<(OutPoint, UtxoEntry)>, RillError> {
        let cf = self.cf_handle(CF_UTXOS)?;
        let mut utxos = Vec::new();

        let iter = self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start);
        for item in iter {
            let (key_bytes, value_bytes) = item.map_err(|e| RillError::Storage(e.to_string()))?;
            let (outpoint, _): (OutPoint, _) =
                bincode::decode_from_slice(&key_bytes, bincode::config::standard())
                    .map_err(|e| RillError::Storage(e.to_string()))?;
            let (entry, _): (UtxoEntry, _) =
                bincode::decode_from_slice(&value_bytes, bincode::config::standard())
                    .map_err(|e| RillError::Storage(e.to_string()))?;
            utxos.push((outpoint, entry));
        }

        Ok(utxos)
    }
}
