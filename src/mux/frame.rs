use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::DmsgError;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameType {
    /// opens a sub-stream with a new id
    Open = 1,
    Data = 2,
    /// acknowledges that the receiver read a number of bytes, growing the sender's window
    Ack = 3,
    /// the sender neither writes nor reads the sub-stream any more
    Close = 4,
    /// the stream id field carries an opaque nonce
    Ping = 5,
    Pong = 6,
}

/// A multiplexer frame: `[type u8][stream id u32][payload length u32][payload]`
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub const HEADER_LEN: usize = 9;

    pub fn open(stream_id: u32) -> Frame {
        Self::empty(FrameType::Open, stream_id)
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Frame {
        Frame { frame_type: FrameType::Data, stream_id, payload }
    }

    pub fn ack(stream_id: u32, n: u32) -> Frame {
        Frame {
            frame_type: FrameType::Ack,
            stream_id,
            payload: Bytes::copy_from_slice(&n.to_be_bytes()),
        }
    }

    pub fn close(stream_id: u32) -> Frame {
        Self::empty(FrameType::Close, stream_id)
    }

    pub fn ping(nonce: u32) -> Frame {
        Self::empty(FrameType::Ping, nonce)
    }

    pub fn pong(nonce: u32) -> Frame {
        Self::empty(FrameType::Pong, nonce)
    }

    fn empty(frame_type: FrameType, stream_id: u32) -> Frame {
        Frame { frame_type, stream_id, payload: Bytes::new() }
    }

    /// the acknowledged byte count of an ACK frame
    pub fn ack_value(&self) -> anyhow::Result<u32> {
        let mut b: &[u8] = &self.payload;
        let n = b.try_get_u32()?;
        if !b.is_empty() {
            bail!("ack frame with trailing bytes");
        }
        Ok(n)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.frame_type.into());
        buf.put_u32(self.stream_id);
        buf.put_u32(self.payload.len().prechecked_cast());
        buf.put_slice(&self.payload);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let raw_type = buf.try_get_u8()?;
        let frame_type = FrameType::try_from(raw_type)
            .map_err(|_| DmsgError::UnknownFrameType(raw_type))?;
        let stream_id = buf.try_get_u32()?;
        let len: usize = buf.try_get_u32()?.safe_cast();
        if buf.remaining() < len {
            bail!("frame payload truncated");
        }
        let payload = buf.copy_to_bytes(len);
        Ok(Frame { frame_type, stream_id, payload })
    }

    /// Reads the next frame, returning `None` on EOF at a frame boundary. Payloads bigger than
    ///  `max_payload` are rejected before they are read.
    pub async fn read_from(reader: &mut (impl AsyncRead + Unpin), max_payload: usize) -> anyhow::Result<Option<Frame>> {
        let mut header = [0u8; Self::HEADER_LEN];
        let n = reader.read(&mut header).await?;
        if n == 0 {
            return Ok(None);
        }
        reader.read_exact(&mut header[n..]).await?;

        let mut h: &[u8] = &header;
        let raw_type = h.get_u8();
        let frame_type = FrameType::try_from(raw_type)
            .map_err(|_| DmsgError::UnknownFrameType(raw_type))?;
        let stream_id = h.get_u32();
        let len: usize = h.get_u32().safe_cast();
        if len > max_payload {
            return Err(DmsgError::FrameTooLarge(len).into());
        }

        let mut payload = BytesMut::zeroed(len);
        reader.read_exact(&mut payload).await?;
        Ok(Some(Frame { frame_type, stream_id, payload: payload.freeze() }))
    }
}
