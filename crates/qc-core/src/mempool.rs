//! In-memory pool of unconfirmed transactions (mempool).
//!
//! The mempool stores pending regular and claim transactions. It provides:
//! - O(1) lookup by txid
//! - O(1) conflict detection via spent-outpoint and pending-claim indices
//! - Deterministic, fee-rate-ordered selection for block templates
//!
//! Regular transactions are validated via
//! [`validate_transaction`](crate::validation::validate_transaction) and lock
//! their input outpoints for the duration they remain pending (chained
//! mempool spends are not supported — a transaction may only reference
//! confirmed UTXOs). Claim transactions lock their claimed Bitcoin address
//! instead, since they carry no inputs.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::claim;
use crate::constants::{MAX_CLAIM_COUNT, MIN_FEE_RATE};
use crate::error::MempoolError;
use crate::types::{Hash256, OutPoint, Transaction, UtxoEntry};
use crate::validation;

/// Default maximum number of transactions in the mempool.
pub const DEFAULT_MAX_COUNT: usize = 5_000;

/// Default maximum total serialized bytes in the mempool.
pub const DEFAULT_MAX_BYTES: usize = crate::constants::MAX_MEMPOOL_BYTES;

/// Compute fee rate in qsats per thousand bytes.
fn compute_fee_rate(fee: u64, size: usize) -> u64 {
    if size == 0 {
        return u64::MAX;
    }
    let rate = (fee as u128) * 1000 / (size as u128);
    rate.min(u64::MAX as u128) as u64
}

/// A transaction stored in the mempool with precomputed metadata.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    /// The pending transaction.
    pub tx: Transaction,
    /// Precomputed transaction ID.
    pub txid: Hash256,
    /// Transaction fee in qsats. Always zero for claim transactions, which
    /// mint value from the snapshot rather than spending inputs.
    pub fee: u64,
    /// Serialized size in bytes.
    pub size: usize,
    /// Insertion sequence number, used to break ties deterministically.
    seq: u64,
    fee_rate: u64,
}

impl MempoolEntry {
    /// Fee rate in qsats per thousand bytes. Zero for claim transactions.
    pub fn fee_rate(&self) -> u64 {
        self.fee_rate
    }
}

/// In-memory pool of unconfirmed transactions.
///
/// Not thread-safe — callers should wrap in a `Mutex` or `RwLock` if
/// concurrent access is needed.
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    /// Outpoints locked by pending regular transactions.
    claimed_utxos: HashSet<OutPoint>,
    /// Bitcoin addresses locked by pending claim transactions.
    pending_btc_claims: HashSet<String>,
    max_count: usize,
    max_bytes: usize,
    total_bytes: usize,
    claim_count: usize,
    next_seq: u64,
}

impl Mempool {
    /// Create a new mempool with the given size limits.
    pub fn new(max_count: usize, max_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            claimed_utxos: HashSet::new(),
            pending_btc_claims: HashSet::new(),
            max_count,
            max_bytes,
            total_bytes: 0,
            claim_count: 0,
            next_seq: 0,
        }
    }

    /// Create a new mempool with default size limits.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_COUNT, DEFAULT_MAX_BYTES)
    }

    /// Add a transaction to the mempool.
    ///
    /// - Rejects coinbase transactions outright.
    /// - Claim transactions: rejected if `is_btc_claimed` reports the claimed
    ///   address already redeemed on-chain, if it is already locked by
    ///   another pending claim, or if the pending-claim count has reached
    ///   [`MAX_CLAIM_COUNT`]. If `snapshot_btc_block_hash` is provided, the
    ///   claim's signature is verified against it. No UTXOs are locked.
    /// - Regular transactions: validated against `get_utxo` via
    ///   [`validation::validate_transaction`], rejected if any input is
    ///   already locked by a pending transaction, rejected if the fee rate
    ///   falls below [`MIN_FEE_RATE`]. All inputs are locked on success.
    pub fn add_transaction<F>(
        &mut self,
        tx: Transaction,
        get_utxo: F,
        current_height: u64,
        is_btc_claimed: Option<&dyn Fn(&str) -> bool>,
        snapshot_btc_block_hash: Option<&Hash256>,
    ) -> Result<Hash256, MempoolError>
    where
        F: Fn(&OutPoint) -> Option<UtxoEntry>,
    {
        let txid = tx.txid()?;

        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyExists(txid.to_string()));
        }

        if tx.is_coinbase() {
            return Err(MempoolError::CoinbaseRejected);
        }

        let encoded = bincode::encode_to_vec(&tx, bincode::config::standard())
            .map_err(|e| MempoolError::Internal(e.to_string()))?;
        let size = encoded.len();

        if tx.is_claim() {
            let claim_data = tx.claim.as_ref().expect("is_claim implies claim.is_some()");

            if let Some(is_claimed) = is_btc_claimed {
                if is_claimed(&claim_data.btc_address) {
                    return Err(MempoolError::AlreadyClaimedOnChain(
                        claim_data.btc_address.clone(),
                    ));
                }
            }

            if self.pending_btc_claims.contains(&claim_data.btc_address) {
                return Err(MempoolError::ClaimPending(claim_data.btc_address.clone()));
            }

            if self.claim_count >= MAX_CLAIM_COUNT {
                return Err(MempoolError::TooManyClaims {
                    got: self.claim_count,
                    max: MAX_CLAIM_COUNT,
                });
            }

            // Admission-time check only: the mempool has no snapshot index, so
            // the address type comes from the claim itself rather than a
            // trusted entry. Block validation re-derives it from the snapshot
            // and is the authoritative check.
            if let Some(snapshot_hash) = snapshot_btc_block_hash {
                claim::verify_claim(claim_data, claim_data.address_type, snapshot_hash)?;
            }

            let seq = self.next_seq;
            self.next_seq += 1;

            self.pending_btc_claims.insert(claim_data.btc_address.clone());
            self.claim_count += 1;
            self.total_bytes += size;
            self.entries.insert(
                txid,
                MempoolEntry {
                    tx,
                    txid,
                    fee: 0,
                    size,
                    seq,
                    fee_rate: 0,
                },
            );

            return Ok(txid);
        }

        for input in &tx.inputs {
            if self.claimed_utxos.contains(&input.previous_output) {
                return Err(MempoolError::Conflict {
                    new_txid: txid.to_string(),
                    existing_txid: "pending".to_string(),
                    outpoint: input.previous_output.to_string(),
                });
            }
        }

        let validated = validation::validate_transaction(&tx, get_utxo, current_height)?;

        let fee_rate = compute_fee_rate(validated.fee, size);
        if fee_rate < MIN_FEE_RATE {
            return Err(MempoolError::FeeTooLow {
                got: fee_rate,
                min: MIN_FEE_RATE,
            });
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        for input in &tx.inputs {
            self.claimed_utxos.insert(input.previous_output.clone());
        }
        self.total_bytes += size;
        self.entries.insert(
            txid,
            MempoolEntry {
                tx,
                txid,
                fee: validated.fee,
                size,
                seq,
                fee_rate,
            },
        );

        Ok(txid)
    }

    /// Remove transactions by txid, releasing their locks.
    pub fn remove_transactions(&mut self, txids: &[Hash256]) {
        for txid in txids {
            self.remove_one(*txid);
        }
    }

    fn remove_one(&mut self, txid: Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(&txid)?;
        if entry.tx.is_claim() {
            let claim_data = entry.tx.claim.as_ref().expect("claim entry carries ClaimData");
            self.pending_btc_claims.remove(&claim_data.btc_address);
            self.claim_count -= 1;
        } else {
            for input in &entry.tx.inputs {
                self.claimed_utxos.remove(&input.previous_output);
            }
        }
        self.total_bytes -= entry.size;
        Some(entry)
    }

    /// Re-check every pending transaction against current chain state.
    ///
    /// Evicts regular transactions whose inputs no longer resolve in
    /// `get_utxo`, and claims whose address is now reported claimed by
    /// `is_btc_claimed`. Rebuilds the lock indices from the surviving set.
    pub fn revalidate<F, C>(&mut self, get_utxo: F, is_btc_claimed: C)
    where
        F: Fn(&OutPoint) -> Option<UtxoEntry>,
        C: Fn(&str) -> bool,
    {
        let mut evict = Vec::new();

        for entry in self.entries.values() {
            if let Some(claim_data) = entry.tx.claim.as_ref() {
                if is_btc_claimed(&claim_data.btc_address) {
                    evict.push(entry.txid);
                }
            } else {
                for input in &entry.tx.inputs {
                    if get_utxo(&input.previous_output).is_none() {
                        evict.push(entry.txid);
                        break;
                    }
                }
            }
        }

        for txid in evict {
            self.remove_one(txid);
        }

        // Rebuild lock indices to exactly mirror the surviving set.
        self.claimed_utxos.clear();
        self.pending_btc_claims.clear();
        self.claim_count = 0;
        for entry in self.entries.values() {
            if let Some(claim_data) = entry.tx.claim.as_ref() {
                self.pending_btc_claims.insert(claim_data.btc_address.clone());
                self.claim_count += 1;
            } else {
                for input in &entry.tx.inputs {
                    self.claimed_utxos.insert(input.previous_output.clone());
                }
            }
        }
    }

    /// Transactions ready for block inclusion, in deterministic order:
    /// all claims first (insertion order), then regular transactions sorted
    /// by descending fee rate, ties broken by ascending insertion order.
    pub fn get_transactions_for_block(&self) -> Vec<&MempoolEntry> {
        let mut claims: Vec<&MempoolEntry> = self
            .entries
            .values()
            .filter(|e| e.tx.is_claim())
            .collect();
        claims.sort_by_key(|e| e.seq);

        let mut regular: BTreeSet<(u64, u64, Hash256)> = BTreeSet::new();
        for e in self.entries.values() {
            if !e.tx.is_claim() {
                regular.insert((u64::MAX - e.fee_rate, e.seq, e.txid));
            }
        }

        let mut result = claims;
        for (_, _, txid) in regular {
            if let Some(entry) = self.entries.get(&txid) {
                result.push(entry);
            }
        }
        result
    }

    /// Check if a transaction with the given txid is in the pool.
    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    /// Get a mempool entry by txid.
    pub fn get_transaction(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Whether an outpoint is currently locked by a pending regular transaction.
    pub fn is_utxo_locked(&self, outpoint: &OutPoint) -> bool {
        self.claimed_utxos.contains(outpoint)
    }

    /// Whether a Bitcoin address is currently locked by a pending claim.
    pub fn is_btc_address_pending(&self, btc_address: &str) -> bool {
        self.pending_btc_claims.contains(btc_address)
    }

    /// Number of transactions in the pool.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total serialized bytes of all pending transactions.
    pub fn size_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Number of pending claim transactions.
    pub fn claim_count(&self) -> usize {
        self.claim_count
    }

    /// Maximum transaction count limit.
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    /// Maximum total bytes limit.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Total fees of all pending regular transactions.
    pub fn total_fees(&self) -> u64 {
        self.entries.values().map(|e| e.fee).sum()
    }

    /// Remove all pending transactions.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.claimed_utxos.clear();
        self.pending_btc_claims.clear();
        self.total_bytes = 0;
        self.claim_count = 0;
    }

    /// Collect all txids in the pool.
    pub fn txids(&self) -> Vec<Hash256> {
        self.entries.keys().copied().collect()
    }
}
