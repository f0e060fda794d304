//! Scalar types shared across the protocol: fixed-size byte newtypes,
//! 256-bit amounts and the routable participant identifier.
//!
//! Serde implementations here target the store/wire representation (hex
//! strings for byte types, decimal strings for amounts). Canonical hashing
//! never goes through serde; see [`crate::abi`].

use core::fmt::{self, Debug, Display};

use rand::{distributions::Standard, prelude::Distribution};
use secp256k1::{PublicKey, ThirtyTwoByteHash};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use uint::construct_uint;

fn push_hex(out: &mut String, bytes: &[u8]) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
}

fn parse_hex(s: &str, out: &mut [u8]) -> Result<(), String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() != out.len() * 2 {
        return Err(format!(
            "expected {} hex characters, got {}",
            out.len() * 2,
            s.len()
        ));
    }
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char)
            .to_digit(16)
            .ok_or_else(|| format!("invalid hex character {:?}", chunk[0] as char))?;
        let lo = (chunk[1] as char)
            .to_digit(16)
            .ok_or_else(|| format!("invalid hex character {:?}", chunk[1] as char))?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Ok(())
}

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }
    };
}

macro_rules! bytes_newtype {
    ($T:ident, $N:literal) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl $T {
            pub const fn zero() -> Self {
                Self([0; $N])
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn to_hex(&self) -> String {
                let mut s = String::with_capacity(2 + $N * 2);
                s.push_str("0x");
                push_hex(&mut s, &self.0);
                s
            }

            pub fn from_hex(s: &str) -> Result<Self, String> {
                let mut out = [0u8; $N];
                parse_hex(s, &mut out)?;
                Ok(Self(out))
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self::zero()
            }
        }

        impl Serialize for $T {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(de::Error::custom)
            }
        }

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                let mut out = [0u8; $N];
                rng.fill_bytes(&mut out);
                $T(out)
            }
        }

        impl_hex_debug!($T);
    };
}

bytes_newtype!(Bytes32, 32);
bytes_newtype!(Hash, 32);
bytes_newtype!(Signature, 65);
bytes_newtype!(Address, 20);

impl Hash {
    /// The sentinel root of an empty transfer set.
    pub const ZERO: Hash = Hash([0; 32]);
}

impl ThirtyTwoByteHash for Hash {
    fn into_32(self) -> [u8; 32] {
        self.0
    }
}

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }
}

impl Address {
    /// The zero address, used as the asset id sentinel for the native asset
    /// and as the placeholder asset on setup updates.
    pub const ZERO: Address = Address([0; 20]);
}

impl From<PublicKey> for Address {
    fn from(pk: PublicKey) -> Self {
        // serialize_uncompressed prepends an encoding byte that is not part
        // of the key material.
        let hash: [u8; 32] = Keccak256::digest(&pk.serialize_uncompressed()[1..]).into();
        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

construct_uint! {
    pub struct U256(4);
}

impl U256 {
    pub fn to_be_bytes(self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        bytes
    }
}

impl Serialize for U256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_dec_str(&s).map_err(|e| de::Error::custom(format!("{:?}", e)))
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let mut buf = [0u8; 32];
        rng.fill_bytes(&mut buf);
        U256::from_big_endian(&buf)
    }
}

/// Routable identity of a channel participant, distinct from (but derived
/// from) the on-chain address: `chan` followed by the lowercase hex of the
/// 20-byte address.
///
/// The lexicographic order of identifiers is the deterministic tie-break for
/// concurrent proposals, so the encoding must stay canonical (no mixed case,
/// no `0x` prefix).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicIdentifier(String);

impl PublicIdentifier {
    pub const PREFIX: &'static str = "chan";

    pub fn from_address(addr: Address) -> Self {
        let mut s = String::with_capacity(Self::PREFIX.len() + 40);
        s.push_str(Self::PREFIX);
        push_hex(&mut s, &addr.0);
        PublicIdentifier(s)
    }

    /// Recover the on-chain address this identifier binds to.
    pub fn address(&self) -> Result<Address, String> {
        let hex = self
            .0
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| format!("identifier {:?} lacks the {:?} prefix", self.0, Self::PREFIX))?;
        let mut out = [0u8; 20];
        parse_hex(hex, &mut out)?;
        Ok(Address(out))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PublicIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for PublicIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
