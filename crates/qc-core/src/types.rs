//! Core protocol types: transactions, blocks, UTXOs.
//!
//! All monetary values are in qsats (1 QBTC = 10^8 qsats).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::TransactionError;
use crate::uint256::Uint256;

/// A 32-byte hash value.
///
/// Used for transaction IDs, block header hashes and merkle roots — all
/// double SHA-256.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Used for coinbase previous outpoints.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Double SHA-256 of `data`.
    pub fn hash256(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        Self(Sha256::digest(first).into())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u32,
}

impl OutPoint {
    /// The null outpoint, used for coinbase transaction inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: crate::constants::COINBASE_OUTPUT_INDEX,
        }
    }

    /// Check if this is the null outpoint (coinbase marker).
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == crate::constants::COINBASE_OUTPUT_INDEX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// Which Bitcoin address format a claim's proof-of-ownership signature was made against.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub enum BtcAddressType {
    #[default]
    P2pkh,
    P2wpkh,
    P2shP2wpkh,
    P2tr,
    P2wsh,
    /// `<m> <pubkey1> ... <pubkeyN> <n> OP_CHECKMULTISIG` witness script, m-of-n.
    P2wshMultisig,
}

/// Proof that the signer controls a Bitcoin-snapshot balance, redirecting it to a
/// QubitCoin address. Carried on the dedicated claim transaction that mints the
/// corresponding output; the claimed amount itself is looked up from the snapshot
/// by `btc_address`, never trusted from the transaction itself.
///
/// For every `address_type` except [`BtcAddressType::P2wshMultisig`], only
/// `btc_pubkey`/`signature` are used. For `P2wshMultisig`, `btc_pubkey` and
/// `signature` are empty and the script's pubkeys, signature threshold, and
/// signatures live in `multisig_pubkeys`/`multisig_m`/`multisig_signatures`
/// instead.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct ClaimData {
    /// The Bitcoin address the snapshot balance is recorded under.
    pub btc_address: String,
    /// Address format, determines how the proof fields are interpreted.
    pub address_type: BtcAddressType,
    /// The Bitcoin public key (33-byte compressed secp256k1, or 32-byte x-only for taproot).
    pub btc_pubkey: Vec<u8>,
    /// Signature over the claim message, proving ownership of `btc_pubkey`.
    pub signature: Vec<u8>,
    /// The QubitCoin address the snapshot balance is redirected to.
    pub qcoin_address: Hash256,
    /// Witness script pubkeys in canonical order (`P2wshMultisig` only).
    pub multisig_pubkeys: Vec<Vec<u8>>,
    /// Required signature threshold `m` (`P2wshMultisig` only).
    pub multisig_m: u8,
    /// Signatures aligned by index with `multisig_pubkeys`; an empty entry
    /// means no signature was supplied for that pubkey (`P2wshMultisig` only).
    pub multisig_signatures: Vec<Vec<u8>>,
}

/// A transaction input, spending a previous output. Claim transactions carry no
/// inputs; their authorization lives in [`Transaction::claim`] instead.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The outpoint being spent. Null outpoint for coinbase.
    pub previous_output: OutPoint,
    /// ML-DSA-65 signature. Empty for coinbase inputs.
    pub signature: Vec<u8>,
    /// ML-DSA-65 public key. Empty for coinbase inputs.
    pub public_key: Vec<u8>,
}

/// A transaction output, creating a new UTXO.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in qsats (1 QBTC = 10^8 qsats).
    pub value: u64,
    /// Double-SHA-256 hash of the recipient's ML-DSA-65 public key.
    pub pubkey_hash: Hash256,
}

/// A transaction transferring value between addresses, or a claim transaction
/// minting a new output from a committed Bitcoin-snapshot balance.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Protocol version.
    pub version: u32,
    /// Inputs consuming previous outputs. Empty for claim transactions.
    pub inputs: Vec<TxInput>,
    /// New outputs created by this transaction.
    pub outputs: Vec<TxOutput>,
    /// Block height or timestamp before which this tx is invalid.
    pub lock_time: u64,
    /// Present exactly for claim transactions.
    pub claim: Option<ClaimData>,
}

impl Transaction {
    /// Compute the transaction ID (double SHA-256 of the canonical encoding).
    pub fn txid(&self) -> Result<Hash256, TransactionError> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransactionError::Serialization(e.to_string()))?;
        Ok(Hash256::hash256(&encoded))
    }

    /// Check if this is a coinbase transaction (single input with null outpoint).
    pub fn is_coinbase(&self) -> bool {
        self.claim.is_none() && self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Check if this is a claim transaction (no inputs, carries [`ClaimData`]).
    pub fn is_claim(&self) -> bool {
        self.claim.is_some()
    }

    /// Sum of all output values. Returns None on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }
}

/// Block header containing the proof-of-work puzzle.
///
/// Hashed as double SHA-256 over a fixed 112-byte layout:
/// `version(4) || prev_hash(32) || merkle_root(32) || timestamp_ms(8) || target(32) || nonce(4)`.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Protocol version.
    pub version: u32,
    /// Hash of the previous block header.
    pub prev_hash: Hash256,
    /// Merkle root of the block's transactions.
    pub merkle_root: Hash256,
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// 256-bit difficulty target; a valid header hash must be numerically less than this.
    pub target: Uint256,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

impl BlockHeader {
    /// Compute the block header hash (double SHA-256).
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(crate::constants::HEADER_SIZE);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        data.extend_from_slice(&self.target.to_be_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        debug_assert_eq!(data.len(), crate::constants::HEADER_SIZE);
        Hash256::hash256(&data)
    }

    /// Whether the header hash satisfies its own `target`.
    pub fn meets_target(&self) -> bool {
        Uint256::from_be_bytes(self.hash().0) < self.target
    }
}

/// A complete block: header plus transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    /// Block header with proof-of-work.
    pub header: BlockHeader,
    /// Ordered list of transactions. First transaction must be coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Get the coinbase transaction, if the block is non-empty.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// Claim transactions carried by this block, in order.
    pub fn claims(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter().filter(|tx| tx.is_claim())
    }
}

/// An entry in the unspent transaction output set.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct UtxoEntry {
    /// The unspent output.
    pub output: TxOutput,
    /// Height of the block containing this UTXO.
    pub block_height: u64,
    /// Whether this output is from a coinbase transaction.
    pub is_coinbase: bool,
}

impl UtxoEntry {
    /// Check if this UTXO has matured and can be spent.
    ///
    /// Coinbase outputs require [`COINBASE_MATURITY`](crate::constants::COINBASE_MATURITY)
    /// confirmations. Non-coinbase outputs (including claim outputs) are always mature.
    pub fn is_mature(&self, current_height: u64) -> bool {
        if !self.is_coinbase {
            return true;
        }
        current_height.saturating_sub(self.block_height) >= crate::constants::COINBASE_MATURITY
    }
}
