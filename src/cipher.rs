use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use anyhow::bail;
use bytes::{Buf, BufMut};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

use crate::util::buf::BufExt;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// An entity's identity and at the same time its stable address in the overlay network. This is
///  an Ed25519 verifying key in compressed form.
///
/// NB: The all-zero key is the 'null' key which is never a valid endpoint. Deserializing does not
///  check that the bytes are a valid curve point - that happens lazily when a signature is
///  verified, or when the key is used in a handshake.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub const NULL: PublicKey = PublicKey([0; PUBLIC_KEY_LEN]);

    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> PublicKey {
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0; PUBLIC_KEY_LEN]
    }

    /// first 8 hex digits, for log output
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    pub fn verifying_key(&self) -> anyhow::Result<VerifyingKey> {
        if self.is_null() {
            bail!("null public key");
        }
        Ok(VerifyingKey::from_bytes(&self.0)?)
    }

    pub fn verify(&self, msg: &[u8], sig: &Signature) -> anyhow::Result<()> {
        let key = self.verifying_key()?;
        let sig = ed25519_dalek::Signature::from_bytes(&sig.0);
        key.verify(msg, &sig)?;
        Ok(())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PublicKey> {
        Ok(PublicKey(buf.try_get_array()?))
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

impl FromStr for PublicKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s)?;
        match raw.try_into() {
            Ok(bytes) => Ok(PublicKey(bytes)),
            Err(raw) => bail!("public key must be {} bytes, was {}", PUBLIC_KEY_LEN, raw.len()),
        }
    }
}


#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    /// Deterministic Ed25519 signature
    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.0.sign(msg).to_bytes())
    }

    /// the X25519 private scalar corresponding to this key, for Diffie-Hellman in handshakes
    pub(crate) fn x25519_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.0.to_scalar_bytes())
    }
}

impl Debug for SecretKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(for {})", self.public_key().short())
    }
}

pub fn gen_key_pair() -> (PublicKey, SecretKey) {
    gen_key_pair_with(&mut OsRng)
}

pub fn gen_key_pair_with(rng: &mut (impl RngCore + CryptoRng)) -> (PublicKey, SecretKey) {
    let sk = SecretKey(SigningKey::generate(rng));
    (sk.public_key(), sk)
}

/// converts an identity key into the X25519 public key it corresponds to
pub(crate) fn x25519_public(pk: &PublicKey) -> anyhow::Result<x25519_dalek::PublicKey> {
    let montgomery = pk.verifying_key()?.to_montgomery();
    Ok(x25519_dalek::PublicKey::from(montgomery.to_bytes()))
}


#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Signature([u8; SIGNATURE_LEN]);

impl Signature {
    pub const NULL: Signature = Signature([0; SIGNATURE_LEN]);

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Signature> {
        Ok(Signature(buf.try_get_array()?))
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..4]))
    }
}

impl Default for Signature {
    fn default() -> Self {
        Signature::NULL
    }
}


#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct Sha256Hash([u8; 32]);

impl Sha256Hash {
    pub fn of(data: &[u8]) -> Sha256Hash {
        Sha256Hash(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Sha256Hash> {
        Ok(Sha256Hash(buf.try_get_array()?))
    }
}

impl Debug for Sha256Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sha256Hash({})", hex::encode(&self.0[..8]))
    }
}
