//! Protocol constants. All monetary values are in qsats (1 QBTC = 10^8 qsats).

use crate::types::Hash256;

pub const COIN: u64 = 100_000_000;
pub const MAX_SUPPLY: u64 = 21_000_000 * COIN;
pub const INITIAL_REWARD: u64 = 50 * COIN;
pub const HALVING_INTERVAL: u64 = 210_000;

/// Target time between blocks, in milliseconds.
pub const TARGET_BLOCK_TIME_MS: u64 = 30_000;

/// Number of blocks between difficulty retargets.
pub const ADJUSTMENT_INTERVAL: u64 = 10;

/// Header size in bytes: version(4) + prev_hash(32) + merkle_root(32)
/// + timestamp_ms(8) + target(32) + nonce(4).
pub const HEADER_SIZE: usize = 4 + 32 + 32 + 8 + 32 + 4;

pub const MAX_BLOCK_SIZE: usize = 1_048_576;
pub const MAX_TX_SIZE: usize = 100_000;
pub const MAX_INPUTS: usize = 1000;
pub const MAX_OUTPUTS: usize = 1000;
pub const COINBASE_MATURITY: u64 = 100;
pub const MAX_COINBASE_DATA: usize = 100;

/// Byte length of an ML-DSA-65 public key (pqcrypto-dilithium `dilithium3`).
pub const ML_DSA65_PUBLIC_KEY_BYTES: usize = 1952;
/// Byte length of an ML-DSA-65 detached signature (pqcrypto-dilithium `dilithium3`).
pub const ML_DSA65_SIGNATURE_BYTES: usize = 3293;

/// Median-time-past window size, in blocks.
pub const MTP_WINDOW: usize = 11;

/// Maximum allowed drift into the future for a block timestamp, in milliseconds.
pub const MAX_FUTURE_TIME_MS: u64 = 2 * 60 * 60 * 1000;

/// Maximum number of claim transactions permitted per block.
pub const MAX_CLAIM_COUNT: usize = 1000;

/// Minimum fee rate (qsats per thousand bytes) accepted into the mempool.
pub const MIN_FEE_RATE: u64 = 1000;

/// Default maximum mempool size in bytes.
pub const MAX_MEMPOOL_BYTES: usize = 300 * 1024 * 1024;

/// Maximum size of a single framed P2P message.
pub const MAX_MESSAGE_SIZE: usize = 5 * 1024 * 1024;

pub const PROTOCOL_VERSION: u32 = 2;
pub const MIN_PROTOCOL_VERSION: u32 = 2;

/// Sentinel txid used for the implicit coinbase previous-output.
pub const COINBASE_TXID: Hash256 = Hash256::ZERO;

/// Sentinel txid used for claim-input previous-outputs (claims have no prior UTXO).
pub const CLAIM_TXID: Hash256 = Hash256([0xFFu8; 32]);

pub const COINBASE_OUTPUT_INDEX: u32 = 0xFFFF_FFFF;

pub const DEFAULT_P2P_PORT: u16 = 28333;
pub const DEFAULT_RPC_PORT: u16 = 28332;

pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
pub const IDLE_PING_SECS: u64 = 60;
pub const PONG_TIMEOUT_SECS: u64 = 30;
pub const IBD_STALL_SECS: u64 = 20;

pub const RATE_LIMIT_CAPACITY: u32 = 100;
pub const RATE_LIMIT_REFILL_PER_SEC: u32 = 20;

pub const MISBEHAVIOR_BAD_FRAME: i32 = 10;
pub const MISBEHAVIOR_INVALID_BLOCK: i32 = 50;
pub const MISBEHAVIOR_INVALID_TX_SIG: i32 = 20;
pub const MISBEHAVIOR_BAN_THRESHOLD: i32 = 100;

pub const MAX_ADDR_BOOK_ENTRIES: usize = 1000;
pub const MAX_OUTBOUND_PEERS: usize = 8;
pub const MAX_LOCATOR_SIZE: usize = 64;
