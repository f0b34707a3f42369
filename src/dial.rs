use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::addr::Addr;
use crate::cipher::{PublicKey, SecretKey, Sha256Hash, Signature};
use crate::config::HANDSHAKE_PAYLOAD_VERSION;
use crate::error::DmsgError;
use crate::util::buf::{BufExt, BufMutExt};
use crate::util::safe_converter::SafeCast;

fn check_version(buf: &mut impl Buf) -> anyhow::Result<()> {
    let version = buf.try_get_u8()?;
    if version != HANDSHAKE_PAYLOAD_VERSION {
        return Err(DmsgError::HandshakeVersionMismatch { expected: HANDSHAKE_PAYLOAD_VERSION, actual: version }.into());
    }
    Ok(())
}


/// Signed request to open a stream from `src` to `dst`. It travels from the dialing client via the
///  relay server to the destination client, unmodified. `noise_msg` is the first message of the
///  stream level handshake.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamDialRequest {
    /// nanoseconds since the epoch, strictly increasing per source
    pub timestamp: i64,
    pub src: Addr,
    pub dst: Addr,
    pub noise_msg: Bytes,
    pub signature: Signature,
}

impl StreamDialRequest {
    fn ser_unsigned(&self, buf: &mut impl BufMut) {
        buf.put_u8(HANDSHAKE_PAYLOAD_VERSION);
        buf.put_i64(self.timestamp);
        self.src.ser(buf);
        self.dst.ser(buf);
        buf.put_u16_prefixed(&self.noise_msg);
    }

    fn unsigned_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.ser_unsigned(&mut buf);
        buf
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.ser_unsigned(buf);
        self.signature.ser(buf);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<StreamDialRequest> {
        check_version(buf)?;
        let timestamp = buf.try_get_i64()?;
        let src = Addr::try_deser(buf)?;
        let dst = Addr::try_deser(buf)?;
        let noise_msg = buf.try_get_u16_prefixed()?;
        let signature = Signature::try_deser(buf)?;
        Ok(StreamDialRequest { timestamp, src, dst, noise_msg, signature })
    }

    pub fn sign(&mut self, sk: &SecretKey) {
        self.signature = sk.sign(&self.unsigned_bytes());
    }

    /// identifies the request in its response - covers everything except the signature
    pub fn hash(&self) -> Sha256Hash {
        Sha256Hash::of(&self.unsigned_bytes())
    }

    /// Checks the request's addresses, that its timestamp is newer than the last one seen from
    ///  the same source, and its signature
    pub fn verify(&self, last_timestamp: i64) -> Result<(), DmsgError> {
        if self.src.pk.is_null() {
            return Err(DmsgError::ReqInvalidSrcPk);
        }
        if self.src.port == 0 {
            return Err(DmsgError::ReqInvalidSrcPort);
        }
        if self.dst.pk.is_null() {
            return Err(DmsgError::ReqInvalidDstPk);
        }
        if self.dst.port == 0 {
            return Err(DmsgError::ReqInvalidDstPort);
        }
        if self.timestamp <= last_timestamp {
            return Err(DmsgError::ReqInvalidTimestamp);
        }
        self.src.pk.verify(&self.unsigned_bytes(), &self.signature)
            .map_err(|_| DmsgError::ReqInvalidSig)
    }
}


/// Signed answer to a [StreamDialRequest], referring to it by hash
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamDialResponse {
    pub req_hash: Sha256Hash,
    pub accepted: bool,
    /// 0 for accepted requests, see [DmsgError::code]
    pub err_code: u8,
    pub noise_msg: Bytes,
    pub signature: Signature,
}

impl StreamDialResponse {
    pub fn accept(req_hash: Sha256Hash, noise_msg: Bytes, sk: &SecretKey) -> StreamDialResponse {
        let mut result = StreamDialResponse {
            req_hash,
            accepted: true,
            err_code: 0,
            noise_msg,
            signature: Signature::NULL,
        };
        result.sign(sk);
        result
    }

    pub fn reject(req_hash: Sha256Hash, err: &DmsgError, sk: &SecretKey) -> StreamDialResponse {
        let mut result = StreamDialResponse {
            req_hash,
            accepted: false,
            err_code: err.code(),
            noise_msg: Bytes::new(),
            signature: Signature::NULL,
        };
        result.sign(sk);
        result
    }

    fn ser_unsigned(&self, buf: &mut impl BufMut) {
        buf.put_u8(HANDSHAKE_PAYLOAD_VERSION);
        self.req_hash.ser(buf);
        buf.put_u8(self.accepted.into());
        buf.put_u8(self.err_code);
        buf.put_u16_prefixed(&self.noise_msg);
    }

    fn unsigned_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.ser_unsigned(&mut buf);
        buf
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.ser_unsigned(buf);
        self.signature.ser(buf);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<StreamDialResponse> {
        check_version(buf)?;
        let req_hash = Sha256Hash::try_deser(buf)?;
        let accepted = match buf.try_get_u8()? {
            0 => false,
            1 => true,
            other => anyhow::bail!("invalid 'accepted' flag {}", other),
        };
        let err_code = buf.try_get_u8()?;
        let noise_msg = buf.try_get_u16_prefixed()?;
        let signature = Signature::try_deser(buf)?;
        Ok(StreamDialResponse { req_hash, accepted, err_code, noise_msg, signature })
    }

    pub fn sign(&mut self, sk: &SecretKey) {
        self.signature = sk.sign(&self.unsigned_bytes());
    }

    /// Checks that the response answers the request with hash `req_hash`, and that it is signed
    ///  by the request's destination. Rejections may alternatively be signed by the relay server
    ///  (`relay_pk`), which refuses requests it can not forward.
    ///
    /// A valid rejection is reported as the error it carries.
    pub fn verify(&self, dst_pk: &PublicKey, req_hash: &Sha256Hash, relay_pk: Option<&PublicKey>) -> Result<(), DmsgError> {
        if &self.req_hash != req_hash {
            return Err(DmsgError::RespInvalidHash);
        }

        let signed = self.unsigned_bytes();
        let signed_by_dst = dst_pk.verify(&signed, &self.signature).is_ok();
        let signed_by_relay = || relay_pk
            .map(|pk| pk.verify(&signed, &self.signature).is_ok())
            .unwrap_or(false);

        if self.accepted {
            if !signed_by_dst {
                return Err(DmsgError::RespInvalidSig);
            }
            return Ok(());
        }

        if !signed_by_dst && !signed_by_relay() {
            return Err(DmsgError::RespInvalidSig);
        }
        Err(DmsgError::from_code(self.err_code))
    }
}


/// Source of request timestamps, strictly increasing even if the clock is coarse or goes backwards
#[derive(Default)]
pub struct TimestampSource {
    last: AtomicI64,
}

impl TimestampSource {
    pub fn next(&self) -> i64 {
        let now = now_nanos();
        let prev = self.last.fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(now.max(last + 1)))
            .unwrap_or_else(|last| last);
        now.max(prev + 1)
    }
}

pub fn now_nanos() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Last request timestamp seen per source, rejecting replayed or reordered requests
#[derive(Default)]
pub struct TimestampTracker {
    last: Mutex<FxHashMap<PublicKey, i64>>,
}

impl TimestampTracker {
    /// Verifies the request against the last timestamp seen from its source, and records its
    ///  timestamp if it is valid
    pub fn verify(&self, req: &StreamDialRequest) -> Result<(), DmsgError> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let last_timestamp = last.get(&req.src.pk).copied().unwrap_or(i64::MIN);
        req.verify(last_timestamp)?;
        last.insert(req.src.pk, req.timestamp);
        Ok(())
    }
}


/// Writes a handshake object as `[u16 BE length][bytes]`
pub async fn write_object(w: &mut (impl AsyncWrite + Unpin), object: &[u8]) -> anyhow::Result<()> {
    if object.len() > u16::MAX as usize {
        return Err(DmsgError::FrameTooLarge(object.len()).into());
    }
    let mut buf = BytesMut::with_capacity(2 + object.len());
    buf.put_u16_prefixed(object);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_object(r: &mut (impl AsyncRead + Unpin)) -> anyhow::Result<Bytes> {
    let len: usize = r.read_u16().await?.safe_cast();
    let mut buf = BytesMut::zeroed(len);
    r.read_exact(&mut buf).await?;
    Ok(buf.freeze())
}
