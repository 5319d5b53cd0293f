//! Block validation for the QubitCoin protocol.
//!
//! Two levels of validation:
//!
//! - **Structural** ([`validate_block_structure`]): context-free checks on
//!   block format, merkle root, coinbase/claim position, and transaction
//!   structure.
//! - **Contextual** ([`validate_block`]): full validation including header
//!   linkage, proof-of-work, median-time-past, coinbase reward, claim proofs,
//!   and contextual transaction validation with double-spend detection.
//!
//! The genesis block (height 0) is **not** validated through this module.
//! Use [`genesis::is_genesis`](crate::genesis::is_genesis) instead.

use std::collections::HashSet;
use std::sync::Arc;

use crate::claim;
use crate::constants::{MAX_BLOCK_SIZE, MAX_CLAIM_COUNT, MAX_FUTURE_TIME_MS};
use crate::error::{BlockError, ClaimError, TransactionError};
use crate::merkle;
use crate::snapshot::SnapshotIndex;
use crate::types::{Block, Hash256, OutPoint, UtxoEntry};
use crate::uint256::Uint256;
use crate::validation;

/// Context required for full block validation.
///
/// The caller provides these values from the chain state. They describe
/// the expected parent linkage, difficulty, timing, and reward for the
/// block being validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockContext {
    /// Height of the block being validated.
    pub height: u64,
    /// Expected previous block hash (the parent's header hash).
    pub prev_hash: Hash256,
    /// Median timestamp of the last `MTP_WINDOW` blocks, in milliseconds.
    pub median_time_past_ms: u64,
    /// Expected difficulty target for this height.
    pub expected_target: Uint256,
    /// Current wall-clock time in milliseconds (for future timestamp check).
    pub current_time_ms: u64,
    /// Expected base block reward for this height (from halving schedule).
    pub block_reward: u64,
    /// Snapshot Bitcoin block hash, required to verify claim signatures.
    /// `None` on a chain with no fork-snapshot genesis — claims are then
    /// always rejected.
    pub snapshot_btc_block_hash: Option<Hash256>,
    /// Index of preallocated balances (`btcAddress -> SnapshotEntry`) the
    /// snapshot commits to. Empty on a chain with no fork-snapshot genesis,
    /// in which case every claim fails `UnknownSnapshotAddress`.
    pub snapshot_index: Arc<SnapshotIndex>,
}

/// Summary of a successfully validated block.
///
/// Returned by [`validate_block`] after all checks pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedBlock {
    /// Sum of all non-coinbase, non-claim transaction fees in qsats.
    pub total_fees: u64,
    /// Total value of all coinbase outputs in qsats.
    pub coinbase_value: u64,
    /// Number of claim transactions in the block.
    pub claims: usize,
}

/// Check if a block header hash satisfies its claimed proof-of-work target.
pub fn check_pow(block: &Block) -> bool {
    block.header.meets_target()
}

/// Validate block structure (context-free).
///
/// Checks:
/// - At least one transaction (the coinbase)
/// - First transaction is coinbase, no others are
/// - Claim transactions appear immediately after the coinbase, before any
///   regular transaction
/// - At most [`MAX_CLAIM_COUNT`] claim transactions
/// - No duplicate transaction IDs
/// - Merkle root in header matches computed root
/// - Block serialized size is within [`MAX_BLOCK_SIZE`]
/// - Proof-of-work satisfies the header's claimed difficulty
/// - All transactions pass structural validation
pub fn validate_block_structure(block: &Block) -> Result<(), BlockError> {
    // --- Must have at least one transaction (coinbase) ---

    if block.transactions.is_empty() {
        return Err(BlockError::NoCoinbase);
    }

    // --- First transaction must be coinbase ---

    if !block.transactions[0].is_coinbase() {
        return Err(BlockError::FirstTxNotCoinbase);
    }

    // --- No other transaction may be coinbase; claims must precede regular txs ---

    let mut claim_count = 0usize;
    let mut seen_regular = false;

    for (i, tx) in block.transactions.iter().enumerate().skip(1) {
        if tx.is_coinbase() {
            return Err(BlockError::MultipleCoinbase);
        }

        if tx.is_claim() {
            claim_count += 1;
            if seen_regular {
                return Err(BlockError::TransactionError {
                    index: i,
                    source: TransactionError::ClaimOnRegularTx,
                });
            }
        } else {
            seen_regular = true;
        }

        validation::validate_transaction_structure(tx).map_err(|e| {
            BlockError::TransactionError {
                index: i,
                source: e,
            }
        })?;
    }

    if claim_count > MAX_CLAIM_COUNT {
        return Err(BlockError::TooManyClaims {
            got: claim_count,
            max: MAX_CLAIM_COUNT,
        });
    }

    // --- Coinbase structural validation ---

    validation::validate_transaction_structure(&block.transactions[0]).map_err(|e| {
        BlockError::TransactionError {
            index: 0,
            source: e,
        }
    })?;

    // --- No duplicate txids ---

    let mut txids = HashSet::with_capacity(block.transactions.len());
    let mut txid_vec = Vec::with_capacity(block.transactions.len());

    for (i, tx) in block.transactions.iter().enumerate() {
        let txid = tx.txid().map_err(|e| BlockError::TransactionError {
            index: i,
            source: e,
        })?;
        if !txids.insert(txid) {
            return Err(BlockError::DuplicateTxid(txid.to_string()));
        }
        txid_vec.push(txid);
    }

    // --- Merkle root ---

    let computed_root = merkle::merkle_root(&txid_vec);
    if block.header.merkle_root != computed_root {
        return Err(BlockError::InvalidMerkleRoot);
    }

    // --- Block size ---

    let encoded = bincode::encode_to_vec(block, bincode::config::standard())
        .map_err(|e| BlockError::TransactionError {
            index: 0,
            source: TransactionError::Serialization(e.to_string()),
        })?;
    if encoded.len() > MAX_BLOCK_SIZE {
        return Err(BlockError::OversizedBlock {
            size: encoded.len(),
            max: MAX_BLOCK_SIZE,
        });
    }

    // --- PoW (satisfies the header's own claimed difficulty) ---

    if !check_pow(block) {
        return Err(BlockError::InvalidPoW);
    }

    Ok(())
}

/// Verify a claim transaction's proof and its snapshot entry.
///
/// Per-entry checks, in order:
/// 1. `claim.btc_address` must exist in `snapshot_index`.
/// 2. The claimed address must not already be registered on-chain
///    (via `is_claimed`).
/// 3. The transaction carries exactly one output, paying `qcoin_address`.
/// 4. The key material derives the claimed address **under the snapshot
///    entry's recorded type**, never the claim's own `address_type` — a
///    claim cannot pick whichever derivation its key happens to satisfy.
/// 5. The signature(s) verify over the claim message.
/// 6. The output amount matches the snapshot-recorded balance exactly.
fn validate_claim(
    tx: &crate::types::Transaction,
    is_claimed: &impl Fn(&str) -> bool,
    snapshot_btc_block_hash: Option<Hash256>,
    snapshot_index: &SnapshotIndex,
) -> Result<(), ClaimError> {
    let Some(claim) = tx.claim.as_ref() else {
        return Err(ClaimError::NoSnapshot);
    };

    let Some(btc_block_hash) = snapshot_btc_block_hash else {
        return Err(ClaimError::NoSnapshot);
    };

    let entry = snapshot_index
        .get(&claim.btc_address)
        .ok_or_else(|| ClaimError::UnknownSnapshotAddress(claim.btc_address.clone()))?;

    if is_claimed(&claim.btc_address) {
        return Err(ClaimError::AlreadyClaimed(claim.btc_address.clone()));
    }

    if tx.outputs.len() != 1 || tx.outputs[0].pubkey_hash != claim.qcoin_address {
        return Err(ClaimError::AddressMismatch);
    }

    claim::verify_claim(claim, entry.address_type, &btc_block_hash)?;

    if tx.outputs[0].value != entry.amount {
        return Err(ClaimError::AmountMismatch {
            claimed: tx.outputs[0].value,
            expected: entry.amount,
        });
    }

    Ok(())
}

/// Validate a block against the chain state (contextual).
///
/// Performs structural validation, then:
/// - Verifies `prev_hash` matches the expected parent
/// - Verifies `target` matches the expected difficulty
/// - Verifies timestamp is after the median-time-past and not too far in the future
/// - Validates all non-coinbase transactions contextually (signatures, UTXOs, maturity)
/// - Validates all claim transactions against the snapshot and claim registry
/// - Detects double-spending across transactions within the block
/// - Verifies coinbase reward does not exceed `block_reward + total_fees`
///
/// Returns a [`ValidatedBlock`] with computed fees and coinbase value on success.
///
/// `get_utxo` looks up UTXOs from the state **before** this block (intra-block
/// spending of an output created earlier in the same block is not permitted).
/// `is_btc_claimed` reports whether a Bitcoin address has already been
/// redeemed on-chain, again as of the state before this block.
pub fn validate_block<F, C>(
    block: &Block,
    context: &BlockContext,
    get_utxo: F,
    is_btc_claimed: C,
) -> Result<ValidatedBlock, BlockError>
where
    F: Fn(&OutPoint) -> Option<UtxoEntry>,
    C: Fn(&str) -> bool,
{
    // --- Structural checks ---

    validate_block_structure(block)?;

    // --- Header linkage ---

    if block.header.prev_hash != context.prev_hash {
        return Err(BlockError::InvalidPrevHash);
    }

    // --- Difficulty ---

    if block.header.target != context.expected_target {
        return Err(BlockError::InvalidTarget {
            got: block.header.target.to_string(),
            expected: context.expected_target.to_string(),
        });
    }

    // --- Timestamp ---

    if block.header.timestamp_ms <= context.median_time_past_ms {
        return Err(BlockError::TimestampNotAfterMtp);
    }

    let max_time = context.current_time_ms.saturating_add(MAX_FUTURE_TIME_MS);
    if block.header.timestamp_ms > max_time {
        return Err(BlockError::TimestampTooFar(block.header.timestamp_ms));
    }

    // --- Non-coinbase transactions: contextual validation + double-spend detection ---

    let mut block_spent = HashSet::new();
    let mut total_fees: u64 = 0;
    let mut block_claimed = HashSet::new();
    let mut claims = 0usize;

    for (i, tx) in block.transactions.iter().enumerate().skip(1) {
        if tx.is_claim() {
            let claimed_this_block = block_claimed.clone();
            validate_claim(
                tx,
                &|addr: &str| is_btc_claimed(addr) || claimed_this_block.contains(addr),
                context.snapshot_btc_block_hash,
                &context.snapshot_index,
            )
            .map_err(|e| BlockError::ClaimTransactionError { index: i, source: e })?;

            let claim = tx.claim.as_ref().expect("is_claim implies claim.is_some()");
            block_claimed.insert(claim.btc_address.clone());
            claims += 1;
            continue;
        }

        // Cross-transaction double-spend check
        for input in &tx.inputs {
            if !block_spent.insert(input.previous_output.clone()) {
                return Err(BlockError::DoubleSpend(
                    input.previous_output.to_string(),
                ));
            }
        }

        // Full contextual transaction validation
        let validated =
            validation::validate_transaction(tx, &get_utxo, context.height).map_err(|e| {
                BlockError::TransactionError {
                    index: i,
                    source: e,
                }
            })?;

        total_fees = total_fees
            .checked_add(validated.fee)
            .ok_or(BlockError::TransactionError {
                index: i,
                source: TransactionError::ValueOverflow,
            })?;
    }

    // --- Coinbase reward ---

    let coinbase = &block.transactions[0];
    let coinbase_value = coinbase
        .total_output_value()
        .ok_or(BlockError::TransactionError {
            index: 0,
            source: TransactionError::ValueOverflow,
        })?;

    let max_reward = context
        .block_reward
        .checked_add(total_fees)
        .ok_or(BlockError::TransactionError {
            index: 0,
            source: TransactionError::ValueOverflow,
        })?;

    if coinbase_value > max_reward {
        return Err(BlockError::InvalidReward {
            got: coinbase_value,
            expected: max_reward,
        });
    }

    Ok(ValidatedBlock {
        total_fees,
        coinbase_value,
        claims,
    })
}
