//! Block production and validation engine.
//!
//! [`ConsensusEngine`] implements [`BlockProducer`] on top of a [`ChainView`]
//! of the chain state and a [`Mempool`] of pending transactions. It
//! assembles block templates (coinbase plus pending claims plus
//! fee-ordered regular transactions), mines them against the current
//! difficulty target, and validates incoming blocks against the same rules.

use std::sync::Arc;

use qc_core::block_validation::{self, BlockContext};
use qc_core::constants::{HALVING_INTERVAL, MAX_BLOCK_SIZE, MAX_COINBASE_DATA};
use qc_core::difficulty;
use qc_core::error::BlockError;
use qc_core::mempool::Mempool;
use qc_core::reward;
use qc_core::snapshot::SnapshotIndex;
use qc_core::traits::{BlockProducer, ChainView, Clock};
use qc_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};
use qc_core::uint256::Uint256;

/// Block production and validation engine.
///
/// Generic over the chain view and clock so tests can substitute mocks and
/// fixed clocks without touching storage or wall-clock time.
pub struct ConsensusEngine<V: ChainView, C: Clock> {
    chain: Arc<V>,
    mempool: Arc<parking_lot::Mutex<Mempool>>,
    clock: C,
    snapshot_btc_block_hash: Option<Hash256>,
    snapshot_index: Arc<SnapshotIndex>,
}

impl<V: ChainView, C: Clock> ConsensusEngine<V, C> {
    pub fn new(
        chain: Arc<V>,
        mempool: Arc<parking_lot::Mutex<Mempool>>,
        clock: C,
        snapshot_btc_block_hash: Option<Hash256>,
        snapshot_index: Arc<SnapshotIndex>,
    ) -> Self {
        Self {
            chain,
            mempool,
            clock,
            snapshot_btc_block_hash,
            snapshot_index,
        }
    }

    /// Build the [`BlockContext`] that the next block (extending the current
    /// tip) must satisfy.
    fn next_context(&self) -> Result<BlockContext, BlockError> {
        let (tip_height, tip_hash) = self
            .chain
            .chain_tip()
            .map_err(|_| BlockError::InvalidPrevHash)?;
        let height = tip_height + 1;
        let expected_target = self.difficulty_target(height)?;
        let median_time_past_ms = self
            .chain
            .median_time_past(tip_hash)
            .map_err(|_| BlockError::InvalidPrevHash)?;

        Ok(BlockContext {
            height,
            prev_hash: tip_hash,
            median_time_past_ms,
            expected_target,
            current_time_ms: self.clock.now_ms(),
            block_reward: reward::block_reward(height),
            snapshot_btc_block_hash: self.snapshot_btc_block_hash,
            snapshot_index: Arc::clone(&self.snapshot_index),
        })
    }

    /// Greedily fill a block template with pending claims (in mempool
    /// insertion order) followed by regular transactions (highest fee-rate
    /// first), bounded by `MAX_BLOCK_SIZE` minus the header and an estimate
    /// of coinbase size.
    fn select_transactions(&self, coinbase_reserve: usize) -> (Vec<Transaction>, u64) {
        let pool = self.mempool.lock();
        let mut budget = MAX_BLOCK_SIZE
            .saturating_sub(qc_core::constants::HEADER_SIZE)
            .saturating_sub(coinbase_reserve);
        let mut selected = Vec::new();
        let mut total_fees: u64 = 0;

        for entry in pool.get_transactions_for_block() {
            if entry.size > budget {
                continue;
            }
            budget -= entry.size;
            total_fees = total_fees.saturating_add(entry.fee);
            selected.push(entry.tx.clone());
        }

        (selected, total_fees)
    }
}

impl<V: ChainView, C: Clock> BlockProducer for ConsensusEngine<V, C> {
    fn create_block_template(
        &self,
        coinbase_pubkey_hash: &Hash256,
        timestamp_ms: u64,
    ) -> Result<Block, BlockError> {
        let context = self.next_context()?;

        let coinbase_reserve = qc_core::constants::HEADER_SIZE + MAX_COINBASE_DATA + 64;
        let (selected, total_fees) = self.select_transactions(coinbase_reserve);

        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                signature: context.height.to_le_bytes().to_vec(),
                public_key: vec![],
            }],
            outputs: vec![TxOutput {
                value: context.block_reward.saturating_add(total_fees),
                pubkey_hash: *coinbase_pubkey_hash,
            }],
            lock_time: 0,
            claim: None,
        };

        let mut transactions = Vec::with_capacity(selected.len() + 1);
        transactions.push(coinbase);
        transactions.extend(selected);

        let txids: Result<Vec<Hash256>, _> = transactions.iter().map(|tx| tx.txid()).collect();
        let txids = txids.map_err(|e| BlockError::TransactionError { index: 0, source: e })?;
        let merkle_root = qc_core::merkle::merkle_root(&txids);

        Ok(Block {
            header: BlockHeader {
                version: 1,
                prev_hash: context.prev_hash,
                merkle_root,
                timestamp_ms: timestamp_ms.max(context.median_time_past_ms + 1),
                target: context.expected_target,
                nonce: 0,
            },
            transactions,
        })
    }

    fn validate_block(&self, block: &Block) -> Result<(), BlockError> {
        let context = self.next_context()?;
        let chain_for_utxo = Arc::clone(&self.chain);
        let get_utxo = move |op: &OutPoint| chain_for_utxo.get_utxo(op).ok().flatten();
        let chain_for_claims = Arc::clone(&self.chain);
        let is_btc_claimed = move |addr: &str| {
            chain_for_claims.is_btc_address_claimed(addr).unwrap_or(false)
        };

        block_validation::validate_block(block, &context, get_utxo, is_btc_claimed)?;
        Ok(())
    }

    fn block_reward(&self, height: u64) -> u64 {
        reward::block_reward(height)
    }

    fn difficulty_target(&self, height: u64) -> Result<Uint256, BlockError> {
        let (tip_height, tip_hash) = self
            .chain
            .chain_tip()
            .map_err(|_| BlockError::InvalidPrevHash)?;

        if height == 0 {
            return Ok(Uint256::MAX);
        }
        if height != tip_height + 1 {
            return Err(BlockError::InvalidPrevHash);
        }

        let parent_header = self
            .chain
            .get_block_header(&tip_hash)
            .map_err(|_| BlockError::InvalidPrevHash)?
            .ok_or(BlockError::InvalidPrevHash)?;

        let chain = Arc::clone(&self.chain);
        let get_timestamp_ms = move |h: u64| {
            chain
                .get_block_hash(h)
                .ok()
                .flatten()
                .and_then(|hash| chain.get_block_header(&hash).ok().flatten())
                .map(|header| header.timestamp_ms)
                .unwrap_or(0)
        };

        Ok(difficulty::target_for_height(
            height,
            parent_header.target,
            get_timestamp_ms,
        ))
    }

    fn validate_pow(&self, header: &BlockHeader) -> Result<(), BlockError> {
        if header.meets_target() {
            Ok(())
        } else {
            Err(BlockError::InvalidPoW)
        }
    }
}

/// Mine a block template by incrementing its nonce until it satisfies its
/// own target, up to `max_nonce` attempts. Returns whether a solution was
/// found; on success the header's `nonce` field holds it.
pub fn mine_block(block: &mut Block, max_nonce: u64) -> bool {
    for nonce in 0..max_nonce {
        block.header.nonce = nonce as u32;
        if block_validation::check_pow(block) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use qc_core::constants::{self, COIN, TARGET_BLOCK_TIME_MS};
    use qc_core::error::QcError;
    use qc_core::types::UtxoEntry;
    use std::collections::HashMap;

    struct MockChainView {
        utxos: HashMap<OutPoint, UtxoEntry>,
        headers: HashMap<Hash256, BlockHeader>,
        heights: HashMap<u64, Hash256>,
        tip_height: u64,
        tip_hash: Hash256,
        claimed: std::collections::HashSet<String>,
    }

    impl MockChainView {
        fn new() -> Self {
            let genesis_header = BlockHeader {
                version: 1,
                prev_hash: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                timestamp_ms: 0,
                target: Uint256::MAX,
                nonce: 0,
            };
            let genesis_hash = genesis_header.hash();
            let mut headers = HashMap::new();
            headers.insert(genesis_hash, genesis_header);
            let mut heights = HashMap::new();
            heights.insert(0, genesis_hash);

            Self {
                utxos: HashMap::new(),
                headers,
                heights,
                tip_height: 0,
                tip_hash: genesis_hash,
                claimed: std::collections::HashSet::new(),
            }
        }

        fn push_block(&mut self, timestamp_ms: u64) -> Hash256 {
            let header = BlockHeader {
                version: 1,
                prev_hash: self.tip_hash,
                merkle_root: Hash256::ZERO,
                timestamp_ms,
                target: Uint256::MAX,
                nonce: self.tip_height as u32 + 1,
            };
            let hash = header.hash();
            self.tip_height += 1;
            self.tip_hash = hash;
            self.headers.insert(hash, header);
            self.heights.insert(self.tip_height, hash);
            hash
        }
    }

    impl ChainView for MockChainView {
        fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, QcError> {
            Ok(self.utxos.get(outpoint).cloned())
        }

        fn chain_tip(&self) -> Result<(u64, Hash256), QcError> {
            Ok((self.tip_height, self.tip_hash))
        }

        fn cumulative_work(&self) -> Uint256 {
            Uint256::ZERO
        }

        fn get_block_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, QcError> {
            Ok(self.headers.get(hash).cloned())
        }

        fn get_block(&self, _hash: &Hash256) -> Result<Option<Block>, QcError> {
            Ok(None)
        }

        fn get_block_hash(&self, height: u64) -> Result<Option<Hash256>, QcError> {
            Ok(self.heights.get(&height).copied())
        }

        fn circulating_supply(&self) -> Result<u64, QcError> {
            Ok(0)
        }

        fn is_btc_address_claimed(&self, btc_address: &str) -> Result<bool, QcError> {
            Ok(self.claimed.contains(btc_address))
        }

        fn validate_transaction(
            &self,
            _tx: &Transaction,
        ) -> Result<(), qc_core::error::TransactionError> {
            Ok(())
        }
    }

    struct FixedClock(u64);

    impl Clock for FixedClock {
        fn now_ms(&self) -> u64 {
            self.0
        }
    }

    fn make_engine(
        chain: MockChainView,
        now_ms: u64,
    ) -> ConsensusEngine<MockChainView, FixedClock> {
        ConsensusEngine::new(
            Arc::new(chain),
            Arc::new(parking_lot::Mutex::new(Mempool::with_defaults())),
            FixedClock(now_ms),
            Some(Hash256([0x99; 32])),
            Arc::new(SnapshotIndex::empty()),
        )
    }

    #[test]
    fn block_reward_follows_halving_schedule() {
        let engine = make_engine(MockChainView::new(), 1);
        assert_eq!(engine.block_reward(0), constants::INITIAL_REWARD);
        assert_eq!(
            engine.block_reward(HALVING_INTERVAL),
            constants::INITIAL_REWARD / 2
        );
    }

    #[test]
    fn difficulty_target_genesis_is_max() {
        let engine = make_engine(MockChainView::new(), 1);
        assert_eq!(engine.difficulty_target(0).unwrap(), Uint256::MAX);
    }

    #[test]
    fn difficulty_target_inherits_parent_off_boundary() {
        let engine = make_engine(MockChainView::new(), 1);
        assert_eq!(engine.difficulty_target(1).unwrap(), Uint256::MAX);
    }

    #[test]
    fn difficulty_target_rejects_non_tip_successor() {
        let engine = make_engine(MockChainView::new(), 1);
        assert_eq!(
            engine.difficulty_target(5).unwrap_err(),
            BlockError::InvalidPrevHash
        );
    }

    #[test]
    fn validate_pow_accepts_max_target() {
        let engine = make_engine(MockChainView::new(), 1);
        let header = BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp_ms: 1,
            target: Uint256::MAX,
            nonce: 0,
        };
        assert!(engine.validate_pow(&header).is_ok());
    }

    #[test]
    fn validate_pow_rejects_impossible_target() {
        let engine = make_engine(MockChainView::new(), 1);
        let header = BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp_ms: 1,
            target: Uint256::ONE,
            nonce: 0,
        };
        assert_eq!(engine.validate_pow(&header).unwrap_err(), BlockError::InvalidPoW);
    }

    #[test]
    fn create_block_template_has_coinbase_and_paid_reward() {
        let mut chain = MockChainView::new();
        chain.push_block(1_000);
        let engine = make_engine(chain, 10_000_000 + TARGET_BLOCK_TIME_MS);
        let pkh = Hash256([0x42; 32]);
        let block = engine
            .create_block_template(&pkh, 10_000_000 + TARGET_BLOCK_TIME_MS)
            .unwrap();

        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_coinbase());
        assert_eq!(
            block.transactions[0].outputs[0].value,
            constants::INITIAL_REWARD
        );
        assert_eq!(block.transactions[0].outputs[0].pubkey_hash, pkh);
    }

    #[test]
    fn create_block_template_merkle_root_matches_coinbase_only() {
        let mut chain = MockChainView::new();
        chain.push_block(1_000);
        let engine = make_engine(chain, 10_000_000 + TARGET_BLOCK_TIME_MS);
        let pkh = Hash256([0x7; 32]);
        let block = engine
            .create_block_template(&pkh, 10_000_000 + TARGET_BLOCK_TIME_MS)
            .unwrap();

        let txid = block.transactions[0].txid().unwrap();
        let expected = qc_core::merkle::merkle_root(&[txid]);
        assert_eq!(block.header.merkle_root, expected);
    }

    #[test]
    fn mine_block_finds_nonce_under_max_target() {
        let mut chain = MockChainView::new();
        chain.push_block(1_000);
        let engine = make_engine(chain, 10_000_000 + TARGET_BLOCK_TIME_MS);
        let pkh = Hash256([0x55; 32]);
        let mut block = engine
            .create_block_template(&pkh, 10_000_000 + TARGET_BLOCK_TIME_MS)
            .unwrap();
        assert!(mine_block(&mut block, 100));
        assert!(block_validation::check_pow(&block));
    }

    #[test]
    fn mine_block_gives_up_under_impossible_target() {
        let header = BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp_ms: 1,
            target: Uint256::ONE,
            nonce: 0,
        };
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                signature: vec![],
                public_key: vec![],
            }],
            outputs: vec![TxOutput {
                value: 50 * COIN,
                pubkey_hash: Hash256::ZERO,
            }],
            lock_time: 0,
            claim: None,
        };
        let mut block = Block {
            header,
            transactions: vec![coinbase],
        };
        assert!(!mine_block(&mut block, 50));
    }

    #[test]
    fn create_then_mine_then_validate_round_trip() {
        let mut chain = MockChainView::new();
        chain.push_block(1_000);
        let now = 10_000_000 + TARGET_BLOCK_TIME_MS;
        let engine = make_engine(chain, now);
        let pkh = Hash256([0x9; 32]);
        let mut block = engine.create_block_template(&pkh, now).unwrap();
        assert!(mine_block(&mut block, 1_000_000));
        assert!(engine.validate_block(&block).is_ok());
    }

    #[test]
    fn validate_block_rejects_wrong_prev_hash() {
        let mut chain = MockChainView::new();
        chain.push_block(1_000);
        let now = 10_000_000 + TARGET_BLOCK_TIME_MS;
        let engine = make_engine(chain, now);
        let pkh = Hash256([0x1; 32]);
        let mut block = engine.create_block_template(&pkh, now).unwrap();
        block.header.prev_hash = Hash256([0xFF; 32]);
        mine_block(&mut block, 1_000_000);
        assert_eq!(
            engine.validate_block(&block).unwrap_err(),
            BlockError::InvalidPrevHash
        );
    }

    fn _assert_object_safe(_: &dyn BlockProducer) {}
}
