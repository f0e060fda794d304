//! Creation and verification of Ethereum-style recoverable signatures.
//!
//! Updates are signed over their canonical hash (see [`crate::abi`]) with the
//! `\x19Ethereum Signed Message:\n32` prefix, the format dispute contracts
//! expect, so the same signatures serve both the off-chain exchange and an
//! on-chain dispute submission.

use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha3::{Digest, Keccak256};

use crate::types::{Address, Hash, PublicIdentifier, Signature};

pub use secp256k1::Error;

/// Add the `\x19Ethereum Signed Message\n<length>` prefix to a hash. Packed
/// encoding, so the slot serializer cannot be used here.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

/// Holds the channel key and produces recoverable signatures.
#[derive(Debug)]
pub struct Signer {
    secp: Secp256k1<All>,
    sk: SecretKey,
    addr: Address,
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let secp = Secp256k1::new();
        let (sk, pk) = secp.generate_keypair(rng);
        Self {
            secp,
            sk,
            addr: pk.into(),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, Error> {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(bytes)?;
        let pk = PublicKey::from_secret_key(&secp, &sk);
        Ok(Self {
            secp,
            sk,
            addr: pk.into(),
        })
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    /// The routable identifier bound to this signer's address.
    pub fn public_identifier(&self) -> PublicIdentifier {
        PublicIdentifier::from_address(self.addr)
    }

    /// Sign a hash using an Ethereum 65-byte recoverable signature.
    ///
    /// Note that this differs from transaction signatures, as it does not
    /// include the length. 64-byte compact signatures (EIP-2098) would be
    /// possible but are not implemented here.
    pub fn sign_eth(&self, msg: Hash) -> Signature {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        // sign_ecdsa_recoverable so the counterparty (and the contract) can
        // recover the address; the recovery id becomes v.
        let sig = self
            .secp
            .sign_ecdsa_recoverable(&Message::from(hash), &self.sk);

        let (v, rs) = sig.serialize_compact();

        // EIP-2 makes non-canonical s values (high bit set) invalid. The
        // library already produces canonical signatures; fail early here if
        // that ever changes.
        debug_assert!(rs[32] & 0x80 == 0);

        // EIP-2098: yParity (v) is offset by 27.
        let v: u8 = 27 + v.to_i32() as u8;

        Signature::new(&rs, v)
    }
}

/// Recover the signing address from a signature.
///
/// `hash` is the hash given to [`Signer::sign_eth`], without the
/// `Ethereum Signed Message` prefix.
pub fn recover_signer(hash: Hash, eth_sig: Signature) -> Result<Address, Error> {
    let hash = hash_to_eth_signed_msg_hash(hash);

    let rs = &eth_sig.0[..64];
    let v = eth_sig.0[64].wrapping_sub(27);

    let recid = RecoveryId::from_i32(v.into())?;
    let sig = RecoverableSignature::from_compact(rs, recid)?;

    let secp = Secp256k1::verification_only();
    let pk = secp.recover_ecdsa(&Message::from(hash), &sig)?;

    Ok(pk.into())
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn sign_then_recover() {
        let mut rng = StdRng::seed_from_u64(0);
        let signer = Signer::new(&mut rng);

        let msg = Hash([0x42; 32]);
        let sig = signer.sign_eth(msg);

        assert_eq!(recover_signer(msg, sig).unwrap(), signer.address());
    }

    #[test]
    fn recover_rejects_other_message() {
        let mut rng = StdRng::seed_from_u64(1);
        let signer = Signer::new(&mut rng);

        let sig = signer.sign_eth(Hash([0x01; 32]));
        let recovered = recover_signer(Hash([0x02; 32]), sig);

        // Recovery either fails outright or yields a different address.
        match recovered {
            Ok(addr) => assert_ne!(addr, signer.address()),
            Err(_) => {}
        }
    }

    #[test]
    fn identifier_matches_address() {
        let mut rng = StdRng::seed_from_u64(2);
        let signer = Signer::new(&mut rng);

        let id = signer.public_identifier();
        assert_eq!(id.address().unwrap(), signer.address());
    }

    #[test]
    fn distinct_keys_distinct_addresses() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = Signer::new(&mut rng);
        let b = Signer::new(&mut rng);
        assert_ne!(a.address(), b.address());
    }
}
