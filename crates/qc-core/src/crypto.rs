//! Post-quantum cryptographic operations for the QubitCoin protocol.
//!
//! Signing and verification use ML-DSA-65 (the NIST FIPS 204 / Dilithium3
//! parameter set) via `pqcrypto-dilithium`'s `dilithium3` module. Public
//! keys are hashed with double SHA-256 for use in [`TxOutput::pubkey_hash`](crate::types::TxOutput::pubkey_hash).
//!
//! # Signing scheme
//!
//! Transaction inputs are signed using a **sighash** that commits to:
//! - Transaction version and lock_time
//! - All input outpoints (txid + index)
//! - All outputs (value + pubkey_hash)
//! - The index of the input being signed
//!
//! Signatures and public keys are excluded from the sighash to avoid
//! circularity and allow inputs to be signed independently in any order.

use pqcrypto_dilithium::dilithium3;
use pqcrypto_traits::sign::{
    DetachedSignature as _, PublicKey as _, SecretKey as _,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::types::{Hash256, Transaction};

/// ML-DSA-65 keypair for signing transactions.
///
/// The secret key bytes are held in a [`Zeroizing`] buffer and wiped on drop.
/// Use [`KeyPair::generate`] for random keys or [`KeyPair::from_secret_bytes`]
/// for deterministic reconstruction from previously-stored key material.
pub struct KeyPair {
    secret_bytes: Zeroizing<Vec<u8>>,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a random keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        let (pk, sk) = dilithium3::keypair();
        Self {
            secret_bytes: Zeroizing::new(sk.as_bytes().to_vec()),
            public: PublicKey { public_key: pk },
        }
    }

    /// Reconstruct a keypair from previously-stored secret and public key bytes.
    ///
    /// ML-DSA secret keys are not seed-derivable through the safe `pqcrypto` API,
    /// so unlike a seed-based scheme, both halves of the pair must be supplied.
    pub fn from_parts(secret_bytes: &[u8], public_bytes: &[u8]) -> Result<Self, CryptoError> {
        dilithium3::SecretKey::from_bytes(secret_bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        let public = PublicKey::from_bytes(public_bytes)?;
        Ok(Self {
            secret_bytes: Zeroizing::new(secret_bytes.to_vec()),
            public,
        })
    }

    /// Derive the public key from this keypair.
    pub fn public_key(&self) -> PublicKey {
        self.public.clone()
    }

    /// Get the raw secret key bytes. Handle with care.
    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret_bytes
    }

    /// Sign a message, returning the raw ML-DSA-65 detached signature bytes.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let sk = dilithium3::SecretKey::from_bytes(&self.secret_bytes)
            .expect("secret key bytes were produced by dilithium3::keypair");
        dilithium3::detached_sign(message, &sk).as_bytes().to_vec()
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self {
            secret_bytes: self.secret_bytes.clone(),
            public: self.public.clone(),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// ML-DSA-65 public key for verifying signatures and deriving addresses.
///
/// The pubkey hash (double SHA-256 of the raw key bytes) is used in
/// [`TxOutput`](crate::types::TxOutput) to identify the recipient.
#[derive(Clone)]
pub struct PublicKey {
    public_key: dilithium3::PublicKey,
}

impl PublicKey {
    /// Create a public key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let pk = dilithium3::PublicKey::from_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { public_key: pk })
    }

    /// Get the raw public key bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.public_key.as_bytes().to_vec()
    }

    /// Compute the double-SHA-256 pubkey hash used in transaction outputs.
    pub fn pubkey_hash(&self) -> Hash256 {
        pubkey_hash(self.public_key.as_bytes())
    }

    /// Verify an ML-DSA-65 detached signature on a message.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let sig = dilithium3::DetachedSignature::from_bytes(signature)
            .map_err(|_| CryptoError::InvalidSignature)?;
        dilithium3::verify_detached_signature(&sig, message, &self.public_key)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.public_key.as_bytes() == other.public_key.as_bytes()
    }
}

impl Eq for PublicKey {}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.public_key.as_bytes().hash(state);
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_bytes_vec(self.public_key.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

fn serde_bytes_vec<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    bytes.to_vec().serialize(serializer)
}

/// Compute the double-SHA-256 pubkey hash from raw public key bytes.
///
/// This is the hash stored in [`TxOutput::pubkey_hash`](crate::types::TxOutput::pubkey_hash)
/// to identify the owner of an output.
pub fn pubkey_hash(pubkey_bytes: &[u8]) -> Hash256 {
    Hash256::hash256(pubkey_bytes)
}

/// Compute the signing hash (sighash) for a transaction input.
///
/// Commits to all inputs (outpoints only), all outputs, version, lock_time,
/// and the index of the input being signed. Signatures and public keys are
/// excluded to allow independent signing of each input.
pub fn signing_hash(tx: &Transaction, input_index: usize) -> Result<Hash256, CryptoError> {
    if input_index >= tx.inputs.len() {
        return Err(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        });
    }

    let mut data = Vec::new();

    data.extend_from_slice(&tx.version.to_le_bytes());

    data.extend_from_slice(&(tx.inputs.len() as u64).to_le_bytes());
    for input in &tx.inputs {
        data.extend_from_slice(input.previous_output.txid.as_bytes());
        data.extend_from_slice(&input.previous_output.index.to_le_bytes());
    }

    data.extend_from_slice(&(tx.outputs.len() as u64).to_le_bytes());
    for output in &tx.outputs {
        data.extend_from_slice(&output.value.to_le_bytes());
        data.extend_from_slice(output.pubkey_hash.as_bytes());
    }

    data.extend_from_slice(&tx.lock_time.to_le_bytes());
    data.extend_from_slice(&(input_index as u64).to_le_bytes());

    Ok(Hash256::hash256(&data))
}

/// Sign a transaction input in place.
///
/// Computes the signing hash for the given input, signs it with the keypair,
/// and writes the signature and public key bytes into the input.
/// Inputs can be signed in any order since the sighash excludes signatures.
pub fn sign_transaction_input(
    tx: &mut Transaction,
    input_index: usize,
    keypair: &KeyPair,
) -> Result<(), CryptoError> {
    let sighash = signing_hash(tx, input_index)?;
    let signature = keypair.sign(sighash.as_bytes());
    let pubkey_bytes = keypair.public_key().to_bytes();

    tx.inputs[input_index].signature = signature;
    tx.inputs[input_index].public_key = pubkey_bytes;
    Ok(())
}

/// Verify a transaction input's signature against an expected pubkey hash.
///
/// Checks that:
/// 1. The input contains a parseable ML-DSA-65 signature and public key
/// 2. The public key's double-SHA-256 hash matches `expected_pubkey_hash` (the UTXO owner)
/// 3. The ML-DSA-65 signature verifies against the sighash
pub fn verify_transaction_input(
    tx: &Transaction,
    input_index: usize,
    expected_pubkey_hash: &Hash256,
) -> Result<(), CryptoError> {
    if input_index >= tx.inputs.len() {
        return Err(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        });
    }

    let input = &tx.inputs[input_index];

    let pk = PublicKey::from_bytes(&input.public_key)?;

    if pk.pubkey_hash() != *expected_pubkey_hash {
        return Err(CryptoError::PubkeyHashMismatch);
    }

    if input.signature.is_empty() {
        return Err(CryptoError::InvalidSignature);
    }

    let sighash = signing_hash(tx, input_index)?;
    pk.verify(sighash.as_bytes(), &input.signature)
        .map_err(|_| CryptoError::VerificationFailed)
}
