//! Canonical slot encoding and keccak-256 hashing.
//!
//! Every hash both parties must agree on byte-for-byte (update hashes, state
//! commitments, transfer ids, merkle leaves) is produced here. Values encode
//! into 32-byte slots in the Solidity ABI spirit: unsigned integers and
//! addresses right-aligned, `bytes32` raw, booleans as 0/1. Dynamic content
//! (byte strings, text, arrays) commits as `keccak256(contents)` in a single
//! slot, so nested structures hash deterministically without offset
//! bookkeeping.

use sha3::{Digest, Keccak256};

use crate::types::{Address, Bytes32, Hash, U256};

pub const SLOT_SIZE: usize = 32;

pub trait SlotWriter {
    fn write_slot(&mut self, slot: &[u8; SLOT_SIZE]);
}

/// Writer that folds every slot into a keccak-256 state.
pub struct Keccak256Writer {
    hasher: Keccak256,
}

impl Default for Keccak256Writer {
    fn default() -> Self {
        Self {
            hasher: Keccak256::new(),
        }
    }
}

impl SlotWriter for Keccak256Writer {
    fn write_slot(&mut self, slot: &[u8; SLOT_SIZE]) {
        self.hasher.update(slot);
    }
}

impl Keccak256Writer {
    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

/// Types with a canonical slot encoding.
pub trait AbiEncode {
    fn encode<W: SlotWriter>(&self, w: &mut W);
}

/// Hash a value's canonical encoding.
pub fn to_hash<T: AbiEncode + ?Sized>(value: &T) -> Hash {
    let mut w = Keccak256Writer::default();
    value.encode(&mut w);
    w.finalize()
}

/// keccak-256 of raw bytes, without slot padding. Used for transfer
/// initial-state hashes and merkle pair hashing.
pub fn keccak256(bytes: &[u8]) -> Hash {
    Hash(Keccak256::digest(bytes).into())
}

fn write_right_aligned<W: SlotWriter, const N: usize>(w: &mut W, v: [u8; N]) {
    let mut slot = [0u8; SLOT_SIZE];
    slot[SLOT_SIZE - N..].copy_from_slice(&v);
    w.write_slot(&slot);
}

impl AbiEncode for bool {
    fn encode<W: SlotWriter>(&self, w: &mut W) {
        write_right_aligned(w, [*self as u8]);
    }
}

impl AbiEncode for u8 {
    fn encode<W: SlotWriter>(&self, w: &mut W) {
        write_right_aligned(w, self.to_be_bytes());
    }
}

impl AbiEncode for u64 {
    fn encode<W: SlotWriter>(&self, w: &mut W) {
        write_right_aligned(w, self.to_be_bytes());
    }
}

impl AbiEncode for U256 {
    fn encode<W: SlotWriter>(&self, w: &mut W) {
        w.write_slot(&self.to_be_bytes());
    }
}

impl AbiEncode for Address {
    fn encode<W: SlotWriter>(&self, w: &mut W) {
        // Addresses are right-aligned like uints, not left-aligned like
        // fixed-size bytes.
        write_right_aligned(w, self.0);
    }
}

impl AbiEncode for Hash {
    fn encode<W: SlotWriter>(&self, w: &mut W) {
        w.write_slot(&self.0);
    }
}

impl AbiEncode for Bytes32 {
    fn encode<W: SlotWriter>(&self, w: &mut W) {
        w.write_slot(&self.0);
    }
}

impl AbiEncode for [u8] {
    fn encode<W: SlotWriter>(&self, w: &mut W) {
        keccak256(self).encode(w);
    }
}

impl AbiEncode for Vec<u8> {
    fn encode<W: SlotWriter>(&self, w: &mut W) {
        self.as_slice().encode(w);
    }
}

impl AbiEncode for str {
    fn encode<W: SlotWriter>(&self, w: &mut W) {
        keccak256(self.as_bytes()).encode(w);
    }
}

impl AbiEncode for String {
    fn encode<W: SlotWriter>(&self, w: &mut W) {
        self.as_str().encode(w);
    }
}

/// Homogeneous sequences commit as the hash of their length followed by the
/// element encodings. A blanket impl over `Vec<T>` would collide with the
/// content-hash impl for `Vec<u8>`, so the element types are spelled out.
pub(crate) fn encode_seq<W: SlotWriter, T: AbiEncode>(items: &[T], w: &mut W) {
    let mut inner = Keccak256Writer::default();
    (items.len() as u64).encode(&mut inner);
    for item in items {
        item.encode(&mut inner);
    }
    inner.finalize().encode(w);
}

macro_rules! impl_seq_encode {
    ($T:ty) => {
        impl AbiEncode for Vec<$T> {
            fn encode<W: SlotWriter>(&self, w: &mut W) {
                encode_seq(self, w);
            }
        }
    };
}

impl_seq_encode!(Hash);
impl_seq_encode!(Address);
impl_seq_encode!(U256);

impl<T: AbiEncode, const N: usize> AbiEncode for [T; N] {
    fn encode<W: SlotWriter>(&self, w: &mut W) {
        for item in self {
            item.encode(w);
        }
    }
}
