//! Native QubitCoin address encoding.
//!
//! Addresses use Bech32m encoding ([BIP-350]) with human-readable prefixes:
//! - Mainnet: `qbtc1...`
//! - Testnet: `tqbtc1...`
//!
//! Each address encodes a version byte (currently 0) and a 32-byte
//! double-SHA-256 pubkey hash. The Bech32m checksum provides error detection
//! with a guaranteed detection of up to 4 character errors.
//!
//! This is the hand-rolled Bech32m implementation; Bitcoin-snapshot claim
//! address derivation and verification (`P2PKH`/`P2WPKH`/`P2SH-P2WPKH`/`P2TR`/
//! `P2WSH`) lives in [`crate::claim`] and uses the `bech32`/`secp256k1` crates
//! instead, since it must interoperate with real Bitcoin addresses.
//!
//! [BIP-350]: https://github.com/bitcoin/bips/blob/master/bip-0350.mediawiki

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::crypto::PublicKey;
use crate::error::AddressError;
use crate::types::Hash256;

/// Bech32m checksum constant (BIP-350).
const BECH32M_CONST: u32 = 0x2bc830a3;

/// Bech32 character set for encoding 5-bit values.
const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// Current address version.
pub const ADDRESS_VERSION: u8 = 0;

/// Network identifier determining the address prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    /// Mainnet (HRP: "qbtc", addresses start with `qbtc1`).
    Mainnet,
    /// Testnet (HRP: "tqbtc", addresses start with `tqbtc1`).
    Testnet,
}

impl Network {
    /// Human-readable prefix for this network.
    pub fn hrp(&self) -> &'static str {
        match self {
            Network::Mainnet => "qbtc",
            Network::Testnet => "tqbtc",
        }
    }

    /// Look up network from a human-readable prefix.
    pub fn from_hrp(hrp: &str) -> Result<Self, AddressError> {
        match hrp {
            "qbtc" => Ok(Network::Mainnet),
            "tqbtc" => Ok(Network::Testnet),
            _ => Err(AddressError::UnknownNetwork(hrp.to_string())),
        }
    }
}

/// A QubitCoin address encoding a pubkey hash with Bech32m.
///
/// Human-readable form is `qbtc1...` (mainnet) or `tqbtc1...` (testnet).
/// Internally stores the network, version byte, and 32-byte pubkey hash.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    network: Network,
    version: u8,
    pubkey_hash: Hash256,
}

impl Address {
    /// Create an address from a pubkey hash and network.
    pub fn from_pubkey_hash(pubkey_hash: Hash256, network: Network) -> Self {
        Self {
            network,
            version: ADDRESS_VERSION,
            pubkey_hash,
        }
    }

    /// Create an address from a public key and network.
    pub fn from_public_key(public_key: &PublicKey, network: Network) -> Self {
        Self::from_pubkey_hash(public_key.pubkey_hash(), network)
    }

    /// The pubkey hash encoded in this address.
    pub fn pubkey_hash(&self) -> Hash256 {
        self.pubkey_hash
    }

    /// The network this address belongs to.
    pub fn network(&self) -> Network {
        self.network
    }

    /// The address version byte.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Encode this address as a Bech32m string.
    pub fn encode(&self) -> String {
        let hrp = self.network.hrp();
        let data_5bit = convert_bits(self.pubkey_hash.as_bytes(), 8, 5, true)
            .expect("valid 32-byte hash always converts to 5-bit");

        let mut payload = Vec::with_capacity(1 + data_5bit.len());
        payload.push(self.version);
        payload.extend_from_slice(&data_5bit);

        let checksum = bech32m_create_checksum(hrp, &payload);

        let mut result = String::with_capacity(hrp.len() + 1 + payload.len() + 6);
        result.push_str(hrp);
        result.push('1');
        for &d in &payload {
            result.push(CHARSET[d as usize] as char);
        }
        for &d in &checksum {
            result.push(CHARSET[d as usize] as char);
        }
        result
    }

    /// Decode a Bech32m address string.
    pub fn decode(s: &str) -> Result<Self, AddressError> {
        let has_lower = s.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = s.chars().any(|c| c.is_ascii_uppercase());
        if has_lower && has_upper {
            return Err(AddressError::MixedCase);
        }

        let s_lower = s.to_ascii_lowercase();

        let sep_pos = s_lower.rfind('1').ok_or(AddressError::MissingSeparator)?;

        if sep_pos == 0 {
            return Err(AddressError::InvalidHrp);
        }
        if sep_pos + 8 > s_lower.len() {
            return Err(AddressError::InvalidLength);
        }

        let hrp = &s_lower[..sep_pos];
        let data_part = &s_lower[sep_pos + 1..];

        let mut data = Vec::with_capacity(data_part.len());
        for c in data_part.chars() {
            let pos = CHARSET
                .iter()
                .position(|&ch| ch as char == c)
                .ok_or(AddressError::InvalidCharacter(c))?;
            data.push(pos as u8);
        }

        if !bech32m_verify_checksum(hrp, &data) {
            return Err(AddressError::InvalidChecksum);
        }

        let payload = &data[..data.len() - 6];

        if payload.is_empty() {
            return Err(AddressError::InvalidLength);
        }

        let version = payload[0];
        if version != ADDRESS_VERSION {
            return Err(AddressError::InvalidVersion(version));
        }

        let hash_bytes = convert_bits(&payload[1..], 5, 8, false)
            .ok_or(AddressError::InvalidPadding)?;

        if hash_bytes.len() != 32 {
            return Err(AddressError::InvalidLength);
        }

        let network = Network::from_hrp(hrp)?;

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&hash_bytes);

        Ok(Self {
            network,
            version,
            pubkey_hash: Hash256(hash),
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::decode(&s).map_err(serde::de::Error::custom)
    }
}

// --- Bech32m internals ---

/// Compute the Bech32m polymod over a sequence of 5-bit values.
fn bech32m_polymod(values: &[u8]) -> u32 {
    const GEN: [u32; 5] = [0x3b6a57b2, 0x26508e6d, 0x1ea119fa, 0x3d4233dd, 0x2a1462b3];
    let mut chk: u32 = 1;
    for &v in values {
        let b = chk >> 25;
        chk = ((chk & 0x1ffffff) << 5) ^ (v as u32);
        for (i, &g) in GEN.iter().enumerate() {
            if (b >> i) & 1 != 0 {
                chk ^= g;
            }
        }
    }
    chk
}

/// Expand the HRP for Bech32m checksum computation.
fn bech32m_hrp_expand(hrp: &str) -> Vec<u8> {
    let mut ret = Vec::with_capacity(hrp.len() * 2 + 1);
    for c in hrp.bytes() {
        ret.push(c >> 5);
    }
    ret.push(0);
    for c in hrp.bytes() {
        ret.push(c & 31);
    }
    ret
}

/// Create the 6-value Bech32m checksum for the given HRP and data.
fn bech32m_create_checksum(hrp: &str, data: &[u8]) -> Vec<u8> {
    let mut values = bech32m_hrp_expand(hrp);
    values.extend_from_slice(data);
    values.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    let polymod = bech32m_polymod(&values) ^ BECH32M_CONST;
    (0..6)
        .map(|i| ((polymod >> (5 * (5 - i))) & 31) as u8)
        .collect()
}

/// Verify the Bech32m checksum for the given HRP and data (including checksum).
fn bech32m_verify_checksum(hrp: &str, data: &[u8]) -> bool {
    let mut values = bech32m_hrp_expand(hrp);
    values.extend_from_slice(data);
    bech32m_polymod(&values) == BECH32M_CONST
}

/// Convert between bit widths (e.g. 8-bit bytes to 5-bit Bech32 groups).
pub(crate) fn convert_bits(data: &[u8], from_bits: u32, to_bits: u32, pad: bool) -> Option<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut ret = Vec::new();
    let maxv = (1u32 << to_bits) - 1;
    for &value in data {
        let v = value as u32;
        if v >> from_bits != 0 {
            return None;
        }
        acc = (acc << from_bits) | v;
        bits += from_bits;
        while bits >= to_bits {
            bits -= to_bits;
            ret.push(((acc >> bits) & maxv) as u8);
        }
    }
    if pad {
        if bits > 0 {
            ret.push(((acc << (to_bits - bits)) & maxv) as u8);
        }
    } else if bits >= from_bits || ((acc << (to_bits - bits)) & maxv) != 0 {
        return None;
    }
    Some(ret)
}
