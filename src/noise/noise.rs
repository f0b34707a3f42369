use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::trace;
use x25519_dalek::StaticSecret;

use crate::cipher::{x25519_public, PublicKey, SecretKey, PUBLIC_KEY_LEN};
use crate::error::DmsgError;

const HASH_LEN: usize = 32;
const DH_LEN: usize = 32;
pub const AUTH_TAG_LEN: usize = 16;


/// The handshake patterns in use. Sessions use XK because a client knows the public key of the
///  server it dials up front, but the server learns who the client is only during the handshake.
///  Streams use KK because both ends know each other's keys from the dial request.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Pattern {
    XK,
    KK,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Token { E, S, EE, ES, SE, SS }

impl Pattern {
    fn protocol_name(&self) -> &'static [u8] {
        match self {
            Pattern::XK => b"Noise_XK_25519_AESGCM_SHA256",
            Pattern::KK => b"Noise_KK_25519_AESGCM_SHA256",
        }
    }

    fn messages(&self) -> &'static [&'static [Token]] {
        use Token::*;
        match self {
            Pattern::XK => &[&[E, ES], &[E, EE], &[S, SE]],
            Pattern::KK => &[&[E, ES, SS], &[E, EE, SE]],
        }
    }
}

#[derive(Clone)]
pub struct NoiseConfig {
    pub local_pk: PublicKey,
    pub local_sk: Option<SecretKey>,
    /// required for initiators, and for KK responders
    pub remote_pk: Option<PublicKey>,
    pub initiator: bool,
}


struct CipherState {
    cipher: Option<Aes256Gcm>,
    nonce: u64,
}

impl CipherState {
    fn empty() -> CipherState {
        CipherState { cipher: None, nonce: 0 }
    }

    fn with_key(key: &[u8; HASH_LEN]) -> CipherState {
        CipherState {
            cipher: Some(Aes256Gcm::new(key.into())),
            nonce: 0,
        }
    }

    fn has_key(&self) -> bool {
        self.cipher.is_some()
    }

    fn next_nonce(&mut self) -> anyhow::Result<[u8; 12]> {
        if self.nonce == u64::MAX {
            bail!("nonce space exhausted");
        }
        let mut result = [0u8; 12];
        result[4..].copy_from_slice(&self.nonce.to_be_bytes());
        self.nonce += 1;
        Ok(result)
    }

    fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        if self.cipher.is_none() {
            return Ok(plaintext.to_vec());
        }
        let nonce = self.next_nonce()?;
        match &self.cipher {
            Some(cipher) => cipher.encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: ad })
                .map_err(|_| anyhow!("encryption failed")),
            None => unreachable!(),
        }
    }

    fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        if self.cipher.is_none() {
            return Ok(ciphertext.to_vec());
        }
        let nonce = self.next_nonce()?;
        match &self.cipher {
            Some(cipher) => cipher.decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: ad })
                .map_err(|_| DmsgError::Decrypt.into()),
            None => unreachable!(),
        }
    }
}


struct SymmetricState {
    ck: [u8; HASH_LEN],
    h: [u8; HASH_LEN],
    cipher: CipherState,
}

impl SymmetricState {
    fn new(protocol_name: &[u8]) -> SymmetricState {
        let mut h = [0u8; HASH_LEN];
        if protocol_name.len() <= HASH_LEN {
            h[..protocol_name.len()].copy_from_slice(protocol_name);
        }
        else {
            h = Sha256::digest(protocol_name).into();
        }

        SymmetricState {
            ck: h,
            h,
            cipher: CipherState::empty(),
        }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    fn mix_key(&mut self, ikm: &[u8]) {
        let (ck, k) = hkdf2(&self.ck, ikm);
        self.ck = ck;
        self.cipher = CipherState::with_key(&k);
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let ciphertext = self.cipher.encrypt_with_ad(&self.h, plaintext)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let plaintext = self.cipher.decrypt_with_ad(&self.h, ciphertext)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    fn split(&self) -> (CipherState, CipherState) {
        let (k1, k2) = hkdf2(&self.ck, &[]);
        (CipherState::with_key(&k1), CipherState::with_key(&k2))
    }
}

/// HKDF with two outputs as defined by the Noise framework, which is regular HKDF with an empty
///  'info' parameter
fn hkdf2(ck: &[u8; HASH_LEN], ikm: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let mut okm = [0u8; 2*HASH_LEN];
    Hkdf::<Sha256>::new(Some(ck), ikm)
        .expand(&[], &mut okm)
        .expect("64 bytes is a valid HKDF-SHA256 output length");

    let mut out1 = [0u8; HASH_LEN];
    let mut out2 = [0u8; HASH_LEN];
    out1.copy_from_slice(&okm[..HASH_LEN]);
    out2.copy_from_slice(&okm[HASH_LEN..]);
    (out1, out2)
}

fn verify_err(msg: impl Into<String>) -> anyhow::Error {
    DmsgError::HandshakeVerify(msg.into()).into()
}


/// Noise handshake state, turning into a pair of transport ciphers once the handshake is complete.
///
/// Identity keys are Ed25519 keys, converted to X25519 for Diffie-Hellman. Static key tokens
///  carry the Ed25519 key (encrypted) so the receiving side learns the peer's identity rather than
///  its X25519 form.
pub struct Noise {
    pattern: Pattern,
    initiator: bool,
    local_pk: PublicKey,
    s: StaticSecret,
    remote_pk: Option<PublicKey>,
    e: Option<StaticSecret>,
    re: Option<x25519_dalek::PublicKey>,
    symmetric: SymmetricState,
    msg_index: usize,
    transport: Option<(CipherState, CipherState)>,
}

impl Noise {
    pub fn new(pattern: Pattern, config: NoiseConfig) -> anyhow::Result<Noise> {
        let local_sk = match &config.local_sk {
            Some(sk) => sk,
            None => return Err(DmsgError::HandshakeConfig("local secret key missing".to_string()).into()),
        };
        if config.local_pk.is_null() || local_sk.public_key() != config.local_pk {
            return Err(DmsgError::HandshakeConfig("local public key does not match secret key".to_string()).into());
        }

        let remote_required = config.initiator || pattern == Pattern::KK;
        match config.remote_pk {
            Some(pk) if pk.is_null() => return Err(DmsgError::HandshakeConfig("null remote public key".to_string()).into()),
            None if remote_required => return Err(DmsgError::HandshakeConfig("remote public key missing".to_string()).into()),
            _ => {}
        }

        let mut symmetric = SymmetricState::new(pattern.protocol_name());
        symmetric.mix_hash(&[]); // empty prologue

        let (initiator_static, responder_static) = if config.initiator {
            (Some(config.local_pk), config.remote_pk)
        }
        else {
            (config.remote_pk, Some(config.local_pk))
        };
        if pattern == Pattern::KK {
            if let Some(pk) = initiator_static {
                symmetric.mix_hash(pk.as_bytes());
            }
        }
        if let Some(pk) = responder_static {
            symmetric.mix_hash(pk.as_bytes());
        }

        Ok(Noise {
            pattern,
            initiator: config.initiator,
            local_pk: config.local_pk,
            s: local_sk.x25519_secret(),
            remote_pk: config.remote_pk,
            e: None,
            re: None,
            symmetric,
            msg_index: 0,
            transport: None,
        })
    }

    /// session level, client side
    pub fn xk_initiator(local_sk: &SecretKey, remote_pk: PublicKey) -> anyhow::Result<Noise> {
        Self::new(Pattern::XK, NoiseConfig {
            local_pk: local_sk.public_key(),
            local_sk: Some(local_sk.clone()),
            remote_pk: Some(remote_pk),
            initiator: true,
        })
    }

    /// session level, server side
    pub fn xk_responder(local_sk: &SecretKey) -> anyhow::Result<Noise> {
        Self::new(Pattern::XK, NoiseConfig {
            local_pk: local_sk.public_key(),
            local_sk: Some(local_sk.clone()),
            remote_pk: None,
            initiator: false,
        })
    }

    /// stream level
    pub fn kk(local_sk: &SecretKey, remote_pk: PublicKey, initiator: bool) -> anyhow::Result<Noise> {
        Self::new(Pattern::KK, NoiseConfig {
            local_pk: local_sk.public_key(),
            local_sk: Some(local_sk.clone()),
            remote_pk: Some(remote_pk),
            initiator,
        })
    }

    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    pub fn local_static(&self) -> PublicKey {
        self.local_pk
    }

    /// The peer's identity - for XK responders, this is known only after the handshake
    pub fn remote_static(&self) -> Option<PublicKey> {
        self.remote_pk
    }

    pub fn handshake_finished(&self) -> bool {
        self.transport.is_some()
    }

    /// true if the next handshake message is written by this side
    pub fn is_my_turn(&self) -> bool {
        !self.handshake_finished() && (self.msg_index % 2 == 0) == self.initiator
    }

    pub fn make_handshake_message(&mut self) -> anyhow::Result<Vec<u8>> {
        if !self.is_my_turn() {
            bail!("not this side's turn to write a handshake message");
        }

        let mut msg = Vec::new();
        for token in self.pattern.messages()[self.msg_index] {
            match token {
                Token::E => {
                    let e = StaticSecret::random_from_rng(OsRng);
                    let e_pub = x25519_dalek::PublicKey::from(&e);
                    msg.extend_from_slice(e_pub.as_bytes());
                    self.symmetric.mix_hash(e_pub.as_bytes());
                    self.e = Some(e);
                }
                Token::S => {
                    let ct = self.symmetric.encrypt_and_hash(self.local_pk.as_bytes())?;
                    msg.extend_from_slice(&ct);
                }
                dh => self.mix_dh(*dh)?,
            }
        }
        let payload = self.symmetric.encrypt_and_hash(&[])?;
        msg.extend_from_slice(&payload);

        self.advance();
        trace!(pattern = ?self.pattern, initiator = self.initiator, len = msg.len(), "wrote handshake message");
        Ok(msg)
    }

    pub fn process_handshake_message(&mut self, msg: &[u8]) -> anyhow::Result<()> {
        if self.handshake_finished() || self.is_my_turn() {
            bail!("not expecting a handshake message");
        }

        let mut rest = msg;
        for token in self.pattern.messages()[self.msg_index] {
            match token {
                Token::E => {
                    if rest.len() < DH_LEN {
                        return Err(verify_err("message too short for ephemeral key"));
                    }
                    let mut re = [0u8; DH_LEN];
                    re.copy_from_slice(&rest[..DH_LEN]);
                    rest = &rest[DH_LEN..];

                    self.symmetric.mix_hash(&re);
                    self.re = Some(x25519_dalek::PublicKey::from(re));
                }
                Token::S => {
                    let len = PUBLIC_KEY_LEN + if self.symmetric.cipher.has_key() { AUTH_TAG_LEN } else { 0 };
                    if rest.len() < len {
                        return Err(verify_err("message too short for static key"));
                    }
                    let raw = self.symmetric.decrypt_and_hash(&rest[..len])
                        .map_err(|_| verify_err("cannot decrypt static key"))?;
                    rest = &rest[len..];

                    let mut bytes = [0u8; PUBLIC_KEY_LEN];
                    bytes.copy_from_slice(&raw);
                    let rs = PublicKey::from_bytes(bytes);
                    if rs.is_null() || rs.verifying_key().is_err() {
                        return Err(verify_err("remote static key is not a valid public key"));
                    }
                    if let Some(expected) = self.remote_pk {
                        if expected != rs {
                            return Err(verify_err("remote static key does not match expected key"));
                        }
                    }
                    self.remote_pk = Some(rs);
                }
                dh => self.mix_dh(*dh)?,
            }
        }
        self.symmetric.decrypt_and_hash(rest)
            .map_err(|_| verify_err("cannot decrypt handshake payload"))?;

        self.advance();
        trace!(pattern = ?self.pattern, initiator = self.initiator, len = msg.len(), "processed handshake message");
        Ok(())
    }

    fn advance(&mut self) {
        self.msg_index += 1;
        if self.msg_index == self.pattern.messages().len() {
            let (c1, c2) = self.symmetric.split();
            self.transport = Some(if self.initiator { (c1, c2) } else { (c2, c1) });
            self.e = None;
        }
    }

    fn mix_dh(&mut self, token: Token) -> anyhow::Result<()> {
        let use_local_ephemeral = match token {
            Token::EE => true,
            Token::ES => self.initiator,
            Token::SE => !self.initiator,
            Token::SS => false,
            _ => unreachable!("not a DH token"),
        };
        let use_remote_ephemeral = match token {
            Token::EE => true,
            Token::ES => !self.initiator,
            Token::SE => self.initiator,
            _ => false,
        };

        let remote = if use_remote_ephemeral {
            self.re.ok_or_else(|| verify_err("remote ephemeral key missing"))?
        }
        else {
            let rs = self.remote_pk.ok_or_else(|| verify_err("remote static key missing"))?;
            x25519_public(&rs).map_err(|e| verify_err(e.to_string()))?
        };

        let shared = if use_local_ephemeral {
            match &self.e {
                Some(e) => e.diffie_hellman(&remote),
                None => bail!("local ephemeral key missing"),
            }
        }
        else {
            self.s.diffie_hellman(&remote)
        };
        if !shared.was_contributory() {
            return Err(verify_err("low order remote key"));
        }

        self.symmetric.mix_key(shared.as_bytes());
        Ok(())
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        match &mut self.transport {
            Some((send, _)) => send.encrypt_with_ad(&[], plaintext),
            None => bail!("encrypt before handshake is finished"),
        }
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        match &mut self.transport {
            Some((_, recv)) => recv.decrypt_with_ad(&[], ciphertext),
            None => bail!("decrypt before handshake is finished"),
        }
    }
}
