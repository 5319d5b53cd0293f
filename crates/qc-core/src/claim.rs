//! Bitcoin-snapshot claim verification.
//!
//! A claim transaction redirects a balance recorded against a Bitcoin address
//! in the genesis snapshot to a QubitCoin address, authorized by a signature
//! proving control of the Bitcoin private key. This module derives the
//! expected Bitcoin address for a claimed public key (so a forged pubkey
//! can't be substituted for the snapshot's recorded owner) and verifies the
//! claim signature itself.
//!
//! Supported address types: P2PKH, P2WPKH, P2SH-P2WPKH, P2TR, a single-key
//! P2WSH (`<pubkey> OP_CHECKSIG`), and an m-of-n P2WSH multisig
//! (`<m> <pubkey1> ... <pubkeyN> <n> OP_CHECKMULTISIG`).

use ripemd::Ripemd160;
use secp256k1::{ecdsa, schnorr, Message, PublicKey as Secp256k1PublicKey, Scalar, Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};

use crate::error::ClaimError;
use crate::types::{BtcAddressType, ClaimData, Hash256};

const BECH32_BTC_HRP: &str = "bc";
const P2PKH_VERSION: u8 = 0x00;
const P2SH_VERSION: u8 = 0x05;

fn sha256d(data: &[u8]) -> [u8; 32] {
    Sha256::digest(Sha256::digest(data)).into()
}

fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}

/// BIP-340/341 tagged hash: `SHA256(SHA256(tag) || SHA256(tag) || msg)`.
fn tagged_hash(tag: &str, msg: &[u8]) -> [u8; 32] {
    let tag_hash = Sha256::digest(tag.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher.update(msg);
    hasher.finalize().into()
}

/// BIP-341 key-path-only taproot output key, with no script-path commitment.
fn tap_tweak(
    secp: &Secp256k1<secp256k1::VerifyOnly>,
    internal_key: &XOnlyPublicKey,
) -> Result<XOnlyPublicKey, ClaimError> {
    let tweak_bytes = tagged_hash("TapTweak", &internal_key.serialize());
    let scalar = Scalar::from_be_bytes(tweak_bytes).map_err(|_| ClaimError::MalformedPublicKey)?;
    let (tweaked, _parity) = internal_key
        .add_tweak(secp, &scalar)
        .map_err(|_| ClaimError::MalformedPublicKey)?;
    Ok(tweaked)
}

fn base58check(version: u8, payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(1 + payload.len() + 4);
    data.push(version);
    data.extend_from_slice(payload);
    let checksum = sha256d(&data);
    data.extend_from_slice(&checksum[..4]);
    bs58::encode(data).into_string()
}

fn bech32_segwit_address(hrp: &str, witness_version: u8, program: &[u8]) -> String {
    let variant = if witness_version == 0 {
        bech32::Variant::Bech32
    } else {
        bech32::Variant::Bech32m
    };
    let mut data = vec![bech32::u5::try_from_u8(witness_version).expect("version < 32")];
    data.extend(
        bech32::convert_bits(program, 8, 5, true)
            .expect("valid program length always converts")
            .into_iter()
            .map(|b| bech32::u5::try_from_u8(b).expect("5-bit value")),
    );
    bech32::encode(hrp, data, variant).expect("valid bech32 encode inputs")
}

/// Compute the Bitcoin address a claimed public key derives to under `address_type`.
///
/// For P2WSH, `btc_pubkey` is the single key embedded in a `<pubkey> OP_CHECKSIG`
/// witness script (the only P2WSH shape this module supports).
pub fn derive_btc_address(
    address_type: BtcAddressType,
    btc_pubkey: &[u8],
) -> Result<String, ClaimError> {
    match address_type {
        BtcAddressType::P2pkh => {
            Secp256k1PublicKey::from_slice(btc_pubkey).map_err(|_| ClaimError::MalformedPublicKey)?;
            Ok(base58check(P2PKH_VERSION, &hash160(btc_pubkey)))
        }
        BtcAddressType::P2wpkh => {
            Secp256k1PublicKey::from_slice(btc_pubkey).map_err(|_| ClaimError::MalformedPublicKey)?;
            Ok(bech32_segwit_address(BECH32_BTC_HRP, 0, &hash160(btc_pubkey)))
        }
        BtcAddressType::P2shP2wpkh => {
            Secp256k1PublicKey::from_slice(btc_pubkey).map_err(|_| ClaimError::MalformedPublicKey)?;
            let mut redeem_script = Vec::with_capacity(22);
            redeem_script.push(0x00);
            redeem_script.push(0x14);
            redeem_script.extend_from_slice(&hash160(btc_pubkey));
            Ok(base58check(P2SH_VERSION, &hash160(&redeem_script)))
        }
        BtcAddressType::P2tr => {
            let xonly = XOnlyPublicKey::from_slice(btc_pubkey)
                .map_err(|_| ClaimError::MalformedPublicKey)?;
            let secp = Secp256k1::verification_only();
            let tweaked = tap_tweak(&secp, &xonly)?;
            Ok(bech32_segwit_address(BECH32_BTC_HRP, 1, &tweaked.serialize()))
        }
        BtcAddressType::P2wsh => {
            Secp256k1PublicKey::from_slice(btc_pubkey).map_err(|_| ClaimError::MalformedPublicKey)?;
            let mut witness_script = Vec::with_capacity(35);
            witness_script.push(0x21);
            witness_script.extend_from_slice(btc_pubkey);
            witness_script.push(0xac);
            let program = Sha256::digest(&witness_script);
            Ok(bech32_segwit_address(BECH32_BTC_HRP, 0, &program))
        }
        BtcAddressType::P2wshMultisig => Err(ClaimError::UnsupportedAddressType),
    }
}

const OP_CHECKMULTISIG: u8 = 0xae;

/// Encode `n` (1..=16) as its corresponding small-integer opcode (`OP_1`..`OP_16`).
fn op_n(n: usize) -> Result<u8, ClaimError> {
    if n == 0 || n > 16 {
        return Err(ClaimError::InvalidMultisigParams(format!(
            "multisig party count {n} out of range 1..=16"
        )));
    }
    Ok(0x50 + n as u8)
}

/// Build the `<m> <pubkey1> ... <pubkeyN> <n> OP_CHECKMULTISIG` witness script
/// for an m-of-n multisig claim and derive its P2WSH address.
///
/// `pubkeys` must be given in the script's canonical order; that order is
/// baked into the resulting address and every signer must sign against it.
pub fn derive_multisig_btc_address(m: u8, pubkeys: &[Vec<u8>]) -> Result<String, ClaimError> {
    if pubkeys.is_empty() {
        return Err(ClaimError::InvalidMultisigParams("no pubkeys".to_string()));
    }
    if (m as usize) == 0 || (m as usize) > pubkeys.len() {
        return Err(ClaimError::InvalidMultisigParams(format!(
            "threshold {m} out of range for {} pubkeys",
            pubkeys.len()
        )));
    }

    let mut witness_script = Vec::with_capacity(1 + pubkeys.len() * 34 + 2);
    witness_script.push(op_n(m as usize)?);
    for pk in pubkeys {
        Secp256k1PublicKey::from_slice(pk).map_err(|_| ClaimError::MalformedPublicKey)?;
        witness_script.push(pk.len() as u8);
        witness_script.extend_from_slice(pk);
    }
    witness_script.push(op_n(pubkeys.len())?);
    witness_script.push(OP_CHECKMULTISIG);

    let program = Sha256::digest(&witness_script);
    Ok(bech32_segwit_address(BECH32_BTC_HRP, 0, &program))
}

/// Recompute the Bitcoin address a claim's key material derives to, under a
/// caller-supplied `address_type` (the snapshot entry's recorded type, not
/// `claim.address_type`, which is attacker-controlled).
fn derive_claim_address(address_type: BtcAddressType, claim: &ClaimData) -> Result<String, ClaimError> {
    match address_type {
        BtcAddressType::P2wshMultisig => {
            derive_multisig_btc_address(claim.multisig_m, &claim.multisig_pubkeys)
        }
        other => derive_btc_address(other, &claim.btc_pubkey),
    }
}

/// Build the message a Bitcoin key must sign to authorize a claim.
///
/// Commits to the claimed Bitcoin address, the destination QubitCoin
/// address, and the snapshot's Bitcoin block hash, so a signature cannot be
/// replayed to redirect a different snapshot entry, to a different
/// recipient, or onto a different snapshot entirely.
pub fn claim_message(btc_address: &str, qcoin_address: &Hash256, snapshot_btc_block_hash: &Hash256) -> Vec<u8> {
    let mut msg = Vec::with_capacity(13 + btc_address.len() + 1 + 64 + 1 + 64);
    msg.extend_from_slice(b"QCOIN_CLAIM:");
    msg.extend_from_slice(btc_address.as_bytes());
    msg.push(b':');
    msg.extend_from_slice(qcoin_address.to_string().as_bytes());
    msg.push(b':');
    msg.extend_from_slice(snapshot_btc_block_hash.to_string().as_bytes());
    msg
}

fn verify_ecdsa_sig(pubkey: &[u8], signature: &[u8], digest: [u8; 32]) -> Result<(), ClaimError> {
    let pk = Secp256k1PublicKey::from_slice(pubkey).map_err(|_| ClaimError::MalformedPublicKey)?;
    let sig = ecdsa::Signature::from_compact(signature)
        .or_else(|_| ecdsa::Signature::from_der(signature))
        .map_err(|_| ClaimError::InvalidSignature)?;
    let msg = Message::from_digest(digest);
    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&msg, &sig, &pk)
        .map_err(|_| ClaimError::InvalidSignature)
}

/// Verify a claim's signature(s) and that its key material derives the
/// expected address.
///
/// `expected_address_type` must come from the snapshot entry recorded under
/// `claim.btc_address`, not `claim.address_type` — the latter is supplied by
/// the claimant and would otherwise let an attacker pick whichever
/// derivation their own key happens to satisfy.
///
/// Does not check the snapshot for whether `btc_address` exists, has
/// already been claimed, or that the claimed amount matches the snapshot
/// balance; callers (block validation, mempool admission) are responsible
/// for that.
pub fn verify_claim(
    claim: &ClaimData,
    expected_address_type: BtcAddressType,
    snapshot_btc_block_hash: &Hash256,
) -> Result<(), ClaimError> {
    let expected = derive_claim_address(expected_address_type, claim)?;
    if expected != claim.btc_address {
        return Err(ClaimError::AddressMismatch);
    }

    let message = claim_message(&claim.btc_address, &claim.qcoin_address, snapshot_btc_block_hash);
    let digest = sha256d(&message);

    match expected_address_type {
        BtcAddressType::P2tr => {
            let xonly = XOnlyPublicKey::from_slice(&claim.btc_pubkey)
                .map_err(|_| ClaimError::MalformedPublicKey)?;
            let sig = schnorr::Signature::from_slice(&claim.signature)
                .map_err(|_| ClaimError::InvalidSignature)?;
            let msg = Message::from_digest(digest);
            let secp = Secp256k1::verification_only();
            secp.verify_schnorr(&sig, &msg, &xonly)
                .map_err(|_| ClaimError::InvalidSignature)
        }
        BtcAddressType::P2wshMultisig => {
            if claim.multisig_signatures.len() != claim.multisig_pubkeys.len() {
                return Err(ClaimError::InvalidMultisigParams(
                    "signature count does not match pubkey count".to_string(),
                ));
            }
            let valid = claim
                .multisig_pubkeys
                .iter()
                .zip(claim.multisig_signatures.iter())
                .filter(|(_, sig)| !sig.is_empty())
                .filter(|(pk, sig)| verify_ecdsa_sig(pk, sig, digest).is_ok())
                .count();
            if valid < claim.multisig_m as usize {
                return Err(ClaimError::InsufficientMultisigSignatures {
                    got: valid,
                    need: claim.multisig_m,
                });
            }
            Ok(())
        }
        _ => verify_ecdsa_sig(&claim.btc_pubkey, &claim.signature, digest),
    }
}
