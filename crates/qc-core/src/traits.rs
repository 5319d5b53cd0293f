//! Trait interfaces for the QubitCoin protocol.
//!
//! These traits define the contracts between crates:
//! - [`ChainView`] — read-only blockchain state (qc-node implements)
//! - [`BlockProducer`] — block creation and validation (qc-consensus implements)
//! - [`NetworkService`] — P2P networking (qc-network implements)

use crate::error::{BlockError, NetworkError, QcError, TransactionError};
use crate::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, UtxoEntry};
use crate::uint256::Uint256;

/// Read-only view of the blockchain state.
///
/// Provides access to the UTXO set, block headers, chain tip, claimed-address
/// registry, and aggregate state needed for validation. Implemented by the
/// full node (qc-node) backed by RocksDB.
pub trait ChainView: Send + Sync {
    /// Look up a UTXO by outpoint. Returns `None` if spent or unknown.
    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, QcError>;

    /// Check whether a UTXO exists and is unspent.
    ///
    /// Default implementation delegates to [`get_utxo`](Self::get_utxo).
    fn contains_utxo(&self, outpoint: &OutPoint) -> Result<bool, QcError> {
        Ok(self.get_utxo(outpoint)?.is_some())
    }

    /// Current chain tip as `(height, block_hash)`.
    fn chain_tip(&self) -> Result<(u64, Hash256), QcError>;

    /// Total accumulated proof-of-work across the canonical chain.
    fn cumulative_work(&self) -> Uint256;

    /// Get a block header by its hash. Returns `None` if not found.
    fn get_block_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, QcError>;

    /// Get a full block by its hash. Returns `None` if not found.
    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, QcError>;

    /// Get the block hash at a given height. Returns `None` if height exceeds tip.
    fn get_block_hash(&self, height: u64) -> Result<Option<Hash256>, QcError>;

    /// Total circulating supply in qsats (sum of all coinbase and claim issuance to date).
    fn circulating_supply(&self) -> Result<u64, QcError>;

    /// Whether a Bitcoin address has already redeemed a claim on this chain.
    fn is_btc_address_claimed(&self, btc_address: &str) -> Result<bool, QcError>;

    /// Validate a transaction against the current UTXO set and consensus rules.
    fn validate_transaction(&self, tx: &Transaction) -> Result<(), TransactionError>;

    /// Iterate over all UTXOs. Used for balance queries and UTXO scanning.
    /// Default implementation returns empty vec (override for production).
    fn iter_utxos(&self) -> Result<Vec<(OutPoint, UtxoEntry)>, QcError> {
        Ok(Vec::new())
    }

    /// Median timestamp of the `MTP_WINDOW` blocks ending at `tip_hash`
    /// (inclusive), walking `prev_hash` links back from it.
    ///
    /// Returns `0` if `tip_hash` is not found (empty chain, i.e. the next
    /// block is the genesis block).
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

/// Source of the current time, abstracted so consensus code can be driven
/// by a fixed clock in tests instead of the system clock.
pub trait Clock: Send + Sync {
    /// Current time as Unix milliseconds.
    fn now_ms(&self) -> u64;
}

/// Block creation, validation, and reward computation.
///
/// Used by the miner to create block templates and by the node
/// to validate incoming blocks. Implemented by the consensus engine (qc-consensus).
pub trait BlockProducer: Send + Sync {
    /// Create a block template with selected mempool transactions and coinbase.
    ///
    /// The coinbase output pays to `coinbase_pubkey_hash` with the appropriate reward.
    /// `timestamp_ms` is the proposed block timestamp (Unix milliseconds).
    fn create_block_template(
        &self,
        coinbase_pubkey_hash: &Hash256,
        timestamp_ms: u64,
    ) -> Result<Block, BlockError>;

    /// Validate a complete block: header PoW, merkle root, all transactions, and reward.
    fn validate_block(&self, block: &Block) -> Result<(), BlockError>;

    /// Compute the base mining reward for a given block height.
    ///
    /// Follows the halving schedule: `INITIAL_REWARD >> (height / HALVING_INTERVAL)`.
    fn block_reward(&self, height: u64) -> u64;

    /// Compute the difficulty target for a given block height.
    fn difficulty_target(&self, height: u64) -> Result<Uint256, BlockError>;

    /// Validate proof-of-work: block header hash must be numerically at or below its own target.
    fn validate_pow(&self, header: &BlockHeader) -> Result<(), BlockError>;
}

/// P2P network operations.
///
/// Abstracts block and transaction propagation over the length-prefixed
/// JSON-over-TCP wire protocol. Implementations handle the actual transport,
/// peer management, and message framing. Implemented by qc-network.
pub trait NetworkService: Send + Sync {
    /// Broadcast a validated block to all connected peers.
    fn broadcast_block(&self, block: &Block) -> Result<(), NetworkError>;

    /// Broadcast a validated transaction to all connected peers.
    fn broadcast_transaction(&self, tx: &Transaction) -> Result<(), NetworkError>;

    /// Number of currently connected peers.
    fn peer_count(&self) -> usize;

    /// Whether the node has at least one connected peer.
    ///
    /// Default implementation: `peer_count() > 0`.
    fn is_connected(&self) -> bool {
        self.peer_count() > 0
    }

    /// Request a specific block from peers by hash.
    fn request_block(&self, hash: &Hash256) -> Result<(), NetworkError>;

    /// Request block headers starting from the given locator hashes.
    ///
    /// Locator hashes are ordered newest-first, allowing peers to find
    /// the common ancestor and send headers from there.
    fn request_headers(&self, locator: &[Hash256]) -> Result<(), NetworkError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants;
    use crate::types::{TxInput, TxOutput};
    use std::collections::HashMap;

    // ------------------------------------------------------------------
    // Mock: ChainView
    // ------------------------------------------------------------------

    struct MockChainView {
        utxos: HashMap<OutPoint, UtxoEntry>,
        headers: HashMap<Hash256, BlockHeader>,
        tip_height: u64,
        tip_hash: Hash256,
        supply: u64,
        claimed: std::collections::HashSet<String>,
        work: Uint256,
    }

    impl MockChainView {
        fn new() -> Self {
            Self {
                utxos: HashMap::new(),
                headers: HashMap::new(),
                tip_height: 0,
                tip_hash: Hash256::ZERO,
                supply: 0,
                claimed: std::collections::HashSet::new(),
                work: Uint256::ZERO,
            }
        }

        fn insert_utxo(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
            self.utxos.insert(outpoint, entry);
        }

        fn insert_header(&mut self, hash: Hash256, header: BlockHeader) {
            self.headers.insert(hash, header);
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
            self.work
        }

        fn get_block_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, QcError> {
            Ok(self.headers.get(hash).cloned())
        }

        fn get_block(&self, _hash: &Hash256) -> Result<Option<Block>, QcError> {
            Ok(None)
        }

        fn get_block_hash(&self, _height: u64) -> Result<Option<Hash256>, QcError> {
            Ok(None)
        }

        fn circulating_supply(&self) -> Result<u64, QcError> {
            Ok(self.supply)
        }

        fn is_btc_address_claimed(&self, btc_address: &str) -> Result<bool, QcError> {
            Ok(self.claimed.contains(btc_address))
        }

        fn validate_transaction(&self, tx: &Transaction) -> Result<(), TransactionError> {
            if tx.inputs.is_empty() || tx.outputs.is_empty() {
                return Err(TransactionError::EmptyInputsOrOutputs);
            }
            for input in &tx.inputs {
                if !input.previous_output.is_null()
                    && !self.utxos.contains_key(&input.previous_output)
                {
                    return Err(TransactionError::UnknownUtxo(
                        input.previous_output.to_string(),
                    ));
                }
            }
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Mock: Clock
    // ------------------------------------------------------------------

    struct FixedClock(u64);

    impl Clock for FixedClock {
        fn now_ms(&self) -> u64 {
            self.0
        }
    }

    // ------------------------------------------------------------------
    // Mock: BlockProducer
    // ------------------------------------------------------------------

    struct MockBlockProducer;

    impl BlockProducer for MockBlockProducer {
        fn create_block_template(
            &self,
            coinbase_pubkey_hash: &Hash256,
            timestamp_ms: u64,
        ) -> Result<Block, BlockError> {
            let coinbase = Transaction {
                version: 1,
                inputs: vec![TxInput {
                    previous_output: OutPoint::null(),
                    signature: vec![],
                    public_key: vec![],
                }],
                outputs: vec![TxOutput {
                    value: self.block_reward(0),
                    pubkey_hash: *coinbase_pubkey_hash,
                }],
                lock_time: 0,
                claim: None,
            };
            Ok(Block {
                header: BlockHeader {
                    version: 1,
                    prev_hash: Hash256::ZERO,
                    merkle_root: Hash256::ZERO,
                    timestamp_ms,
                    target: Uint256::MAX,
                    nonce: 0,
                },
                transactions: vec![coinbase],
            })
        }

        fn validate_block(&self, block: &Block) -> Result<(), BlockError> {
            if block.transactions.is_empty() {
                return Err(BlockError::NoCoinbase);
            }
            self.validate_pow(&block.header)?;
            Ok(())
        }

        fn block_reward(&self, height: u64) -> u64 {
            let halvings = height / constants::HALVING_INTERVAL;
            if halvings >= 64 {
                return 0;
            }
            constants::INITIAL_REWARD >> halvings
        }

        fn difficulty_target(&self, _height: u64) -> Result<Uint256, BlockError> {
            Ok(Uint256::MAX)
        }

        fn validate_pow(&self, _header: &BlockHeader) -> Result<(), BlockError> {
            // Mock: accept everything
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Mock: NetworkService
    // ------------------------------------------------------------------

    struct MockNetworkService {
        peers: usize,
    }

    impl MockNetworkService {
        fn new(peers: usize) -> Self {
            Self { peers }
        }
    }

    impl NetworkService for MockNetworkService {
        fn broadcast_block(&self, _block: &Block) -> Result<(), NetworkError> {
            if self.peers == 0 {
                return Err(NetworkError::PeerDisconnected("no peers".into()));
            }
            Ok(())
        }

        fn broadcast_transaction(&self, _tx: &Transaction) -> Result<(), NetworkError> {
            if self.peers == 0 {
                return Err(NetworkError::PeerDisconnected("no peers".into()));
            }
            Ok(())
        }

        fn peer_count(&self) -> usize {
            self.peers
        }

        fn request_block(&self, _hash: &Hash256) -> Result<(), NetworkError> {
            if self.peers == 0 {
                return Err(NetworkError::PeerDisconnected("no peers".into()));
            }
            Ok(())
        }

        fn request_headers(&self, _locator: &[Hash256]) -> Result<(), NetworkError> {
            if self.peers == 0 {
                return Err(NetworkError::PeerDisconnected("no peers".into()));
            }
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Object safety: verify each trait is dyn-compatible
    // ------------------------------------------------------------------

    fn _assert_chain_view_object_safe(cv: &dyn ChainView) {
        let _ = cv.chain_tip();
    }

    fn _assert_clock_object_safe(c: &dyn Clock) {
        let _ = c.now_ms();
    }

    fn _assert_block_producer_object_safe(bp: &dyn BlockProducer) {
        let _ = bp.block_reward(0);
    }

    fn _assert_network_service_object_safe(ns: &dyn NetworkService) {
        let _ = ns.peer_count();
    }

    // ------------------------------------------------------------------
    // ChainView tests
    // ------------------------------------------------------------------

    #[test]
    fn chain_view_get_utxo_found() {
        let mut cv = MockChainView::new();
        let op = OutPoint { txid: Hash256([1; 32]), index: 0 };
        let entry = UtxoEntry {
            output: TxOutput { value: 100, pubkey_hash: Hash256::ZERO },
            block_height: 0,
            is_coinbase: false,
        };
        cv.insert_utxo(op.clone(), entry.clone());

        let result = cv.get_utxo(&op).unwrap();
        assert_eq!(result, Some(entry));
    }

    #[test]
    fn chain_view_get_utxo_missing() {
        let cv = MockChainView::new();
        let op = OutPoint { txid: Hash256([1; 32]), index: 0 };
        assert_eq!(cv.get_utxo(&op).unwrap(), None);
    }

    #[test]
    fn chain_view_contains_utxo_default() {
        let mut cv = MockChainView::new();
        let op = OutPoint { txid: Hash256([1; 32]), index: 0 };
        assert!(!cv.contains_utxo(&op).unwrap());

        cv.insert_utxo(
            op.clone(),
            UtxoEntry {
                output: TxOutput { value: 1, pubkey_hash: Hash256::ZERO },
                block_height: 0,
                is_coinbase: false,
            },
        );
        assert!(cv.contains_utxo(&op).unwrap());
    }

    #[test]
    fn chain_view_tip() {
        let mut cv = MockChainView::new();
        cv.tip_height = 42;
        cv.tip_hash = Hash256([0xAA; 32]);

        let (h, hash) = cv.chain_tip().unwrap();
        assert_eq!(h, 42);
        assert_eq!(hash, Hash256([0xAA; 32]));
    }

    #[test]
    fn chain_view_supply() {
        let mut cv = MockChainView::new();
        cv.supply = 1_000_000 * constants::COIN;
        assert_eq!(cv.circulating_supply().unwrap(), 1_000_000 * constants::COIN);
    }

    #[test]
    fn chain_view_claimed_address_lookup() {
        let mut cv = MockChainView::new();
        cv.claimed.insert("bc1qexample".to_string());
        assert!(cv.is_btc_address_claimed("bc1qexample").unwrap());
        assert!(!cv.is_btc_address_claimed("bc1qother").unwrap());
    }

    #[test]
    fn chain_view_cumulative_work() {
        let mut cv = MockChainView::new();
        cv.work = Uint256::from_u64(12345);
        assert_eq!(cv.cumulative_work(), Uint256::from_u64(12345));
    }

    #[test]
    fn chain_view_validate_tx_unknown_utxo() {
        let cv = MockChainView::new();
        let tx = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint { txid: Hash256([0xFF; 32]), index: 0 },
                signature: vec![0; 64],
                public_key: vec![0; 32],
            }],
            outputs: vec![TxOutput { value: 100, pubkey_hash: Hash256::ZERO }],
            lock_time: 0,
            claim: None,
        };
        let err = cv.validate_transaction(&tx).unwrap_err();
        assert!(matches!(err, TransactionError::UnknownUtxo(_)));
    }

    #[test]
    fn chain_view_validate_tx_empty() {
        let cv = MockChainView::new();
        let tx = Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![],
            lock_time: 0,
            claim: None,
        };
        let err = cv.validate_transaction(&tx).unwrap_err();
        assert_eq!(err, TransactionError::EmptyInputsOrOutputs);
    }

    #[test]
    fn chain_view_median_time_past_unknown_is_zero() {
        let cv = MockChainView::new();
        assert_eq!(cv.median_time_past(Hash256([0xAB; 32])).unwrap(), 0);
    }

    #[test]
    fn chain_view_median_time_past_walks_ancestors() {
        let mut cv = MockChainView::new();
        let mut prev = Hash256::ZERO;
        let mut last = prev;
        for h in 0..11u64 {
            let header = BlockHeader {
                version: 1,
                prev_hash: prev,
                merkle_root: Hash256::ZERO,
                timestamp_ms: h * 60,
                target: Uint256::MAX,
                nonce: h as u32,
            };
            last = Hash256([h as u8 + 1; 32]);
            cv.insert_header(last, header);
            prev = last;
        }
        assert_eq!(cv.median_time_past(last).unwrap(), 300);
    }

    #[test]
    fn chain_view_as_dyn() {
        let cv = MockChainView::new();
        let dyn_cv: &dyn ChainView = &cv;
        assert_eq!(dyn_cv.chain_tip().unwrap(), (0, Hash256::ZERO));
    }

    // ------------------------------------------------------------------
    // Clock tests
    // ------------------------------------------------------------------

    #[test]
    fn fixed_clock_returns_configured_time() {
        let clock = FixedClock(1_700_000_000_000);
        assert_eq!(clock.now_ms(), 1_700_000_000_000);
    }

    #[test]
    fn fixed_clock_as_dyn() {
        let clock = FixedClock(42);
        let dyn_clock: &dyn Clock = &clock;
        assert_eq!(dyn_clock.now_ms(), 42);
    }

    // ------------------------------------------------------------------
    // BlockProducer tests
    // ------------------------------------------------------------------

    #[test]
    fn block_producer_template_has_coinbase() {
        let bp = MockBlockProducer;
        let pkh = Hash256([0x11; 32]);
        let block = bp.create_block_template(&pkh, 1_700_000_000_000).unwrap();
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_coinbase());
        assert_eq!(block.transactions[0].outputs[0].pubkey_hash, pkh);
    }

    #[test]
    fn block_producer_reward_halves() {
        let bp = MockBlockProducer;
        assert_eq!(bp.block_reward(0), constants::INITIAL_REWARD);
        assert_eq!(
            bp.block_reward(constants::HALVING_INTERVAL),
            constants::INITIAL_REWARD / 2
        );
    }

    #[test]
    fn block_producer_reward_exhausted_after_64_halvings() {
        let bp = MockBlockProducer;
        assert_eq!(bp.block_reward(constants::HALVING_INTERVAL * 64), 0);
    }

    #[test]
    fn block_producer_validates_nonempty_block() {
        let bp = MockBlockProducer;
        let pkh = Hash256([0x22; 32]);
        let block = bp.create_block_template(&pkh, 1_700_000_000_000).unwrap();
        assert!(bp.validate_block(&block).is_ok());
    }

    #[test]
    fn block_producer_rejects_empty_block() {
        let bp = MockBlockProducer;
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_hash: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                timestamp_ms: 0,
                target: Uint256::MAX,
                nonce: 0,
            },
            transactions: vec![],
        };
        let err = bp.validate_block(&block).unwrap_err();
        assert_eq!(err, BlockError::NoCoinbase);
    }

    #[test]
    fn block_producer_difficulty_target() {
        let bp = MockBlockProducer;
        assert_eq!(bp.difficulty_target(0).unwrap(), Uint256::MAX);
    }

    #[test]
    fn block_producer_as_dyn() {
        let bp = MockBlockProducer;
        let dyn_bp: &dyn BlockProducer = &bp;
        assert_eq!(dyn_bp.block_reward(0), constants::INITIAL_REWARD);
    }

    // ------------------------------------------------------------------
    // NetworkService tests
    // ------------------------------------------------------------------

    #[test]
    fn network_service_connected_with_peers() {
        let ns = MockNetworkService::new(3);
        assert!(ns.is_connected());
        assert_eq!(ns.peer_count(), 3);
    }

    #[test]
    fn network_service_not_connected_without_peers() {
        let ns = MockNetworkService::new(0);
        assert!(!ns.is_connected());
    }

    #[test]
    fn network_service_broadcast_fails_without_peers() {
        let ns = MockNetworkService::new(0);
        let tx = Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![],
            lock_time: 0,
            claim: None,
        };
        let err = ns.broadcast_transaction(&tx).unwrap_err();
        assert!(matches!(err, NetworkError::PeerDisconnected(_)));
    }

    #[test]
    fn network_service_broadcast_succeeds_with_peers() {
        let ns = MockNetworkService::new(1);
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_hash: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                timestamp_ms: 0,
                target: Uint256::MAX,
                nonce: 0,
            },
            transactions: vec![],
        };
        assert!(ns.broadcast_block(&block).is_ok());
    }

    #[test]
    fn network_service_request_block_requires_peers() {
        let ns = MockNetworkService::new(0);
        let err = ns.request_block(&Hash256::ZERO).unwrap_err();
        assert!(matches!(err, NetworkError::PeerDisconnected(_)));
    }

    #[test]
    fn network_service_request_headers_requires_peers() {
        let ns = MockNetworkService::new(0);
        let err = ns.request_headers(&[Hash256::ZERO]).unwrap_err();
        assert!(matches!(err, NetworkError::PeerDisconnected(_)));
    }

    #[test]
    fn network_service_as_dyn() {
        let ns = MockNetworkService::new(2);
        let dyn_ns: &dyn NetworkService = &ns;
        assert_eq!(dyn_ns.peer_count(), 2);
    }
}
