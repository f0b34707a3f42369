use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, trace};

use crate::error::DmsgError;
use crate::noise::noise::{Noise, AUTH_TAG_LEN};

pub const PREFIX_LEN: usize = 2;
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;
/// max plaintext per frame - bigger writes are split into several frames
pub const MAX_FRAME_PAYLOAD: usize = MAX_FRAME_SIZE - AUTH_TAG_LEN;


/// Turns a raw byte stream into an encrypted channel: Every write is sent as one or more frames
///  of `[u16 BE length][ciphertext]`, and reads decrypt frame by frame, handing out the plaintext
///  as a continuous byte stream.
///
/// Handshake messages use the same framing, with the raw handshake message in place of the
///  ciphertext.
///
/// Errors while reading or writing are permanent: once a frame failed to decrypt or the
///  underlying connection failed, all subsequent calls in that direction fail with the same error.
pub struct ReadWriter<T> {
    io: T,
    noise: Noise,
    raw_in: BytesMut,
    plain_in: Bytes,
    raw_out: BytesMut,
    read_err: Option<(io::ErrorKind, String)>,
    write_err: Option<(io::ErrorKind, String)>,
}

impl <T: AsyncRead + AsyncWrite + Unpin> ReadWriter<T> {
    pub fn new(io: T, noise: Noise) -> ReadWriter<T> {
        ReadWriter {
            io,
            noise,
            raw_in: BytesMut::with_capacity(8192),
            plain_in: Bytes::new(),
            raw_out: BytesMut::new(),
            read_err: None,
            write_err: None,
        }
    }

    pub fn noise(&self) -> &Noise {
        &self.noise
    }

    pub fn get_ref(&self) -> &T {
        &self.io
    }

    /// number of raw bytes received but not processed yet
    pub fn buffered(&self) -> usize {
        self.raw_in.len()
    }

    /// Runs the handshake for the initiator or responder side (as configured in the [Noise]
    ///  instance) until it is complete on this side.
    pub async fn handshake(&mut self, timeout: Duration) -> anyhow::Result<()> {
        match tokio::time::timeout(timeout, self.do_handshake()).await {
            Ok(result) => result,
            Err(_) => Err(DmsgError::HandshakeTimeout.into()),
        }
    }

    async fn do_handshake(&mut self) -> anyhow::Result<()> {
        while !self.noise.handshake_finished() {
            if self.noise.is_my_turn() {
                let msg = self.noise.make_handshake_message()?;
                self.write_frame(&msg).await?;
            }
            else {
                let msg = match poll_fn(|cx| self.poll_read_frame(cx)).await? {
                    Some(msg) => msg,
                    None => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                };
                self.noise.process_handshake_message(&msg)?;
            }
        }
        debug!(remote = ?self.noise.remote_static(), "noise handshake complete");
        Ok(())
    }

    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.raw_out.put_u16(frame.len() as u16);
        self.raw_out.put_slice(frame);
        poll_fn(|cx| self.poll_write_raw(cx)).await?;
        self.io.flush().await
    }

    /// returns `None` on a clean EOF at a frame boundary
    fn poll_read_frame(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Option<BytesMut>>> {
        loop {
            if self.raw_in.len() >= PREFIX_LEN {
                let len = u16::from_be_bytes([self.raw_in[0], self.raw_in[1]]) as usize;
                if self.raw_in.len() >= PREFIX_LEN + len {
                    self.raw_in.advance(PREFIX_LEN);
                    return Poll::Ready(Ok(Some(self.raw_in.split_to(len))));
                }
                self.raw_in.reserve(PREFIX_LEN + len - self.raw_in.len());
            }
            else {
                self.raw_in.reserve(4096);
            }

            let n = ready!(tokio_util::io::poll_read_buf(Pin::new(&mut self.io), cx, &mut self.raw_in))?;
            if n == 0 {
                if self.raw_in.is_empty() {
                    return Poll::Ready(Ok(None));
                }
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed inside a frame")));
            }
        }
    }

    fn poll_write_raw(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.raw_out.is_empty() {
            let n = ready!(Pin::new(&mut self.io).poll_write(cx, &self.raw_out))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.raw_out.advance(n);
        }
        Poll::Ready(Ok(()))
    }

    fn take_plain(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.plain_in.len());
        buf.put_slice(&self.plain_in[..n]);
        self.plain_in.advance(n);
    }
}

fn permanent(stored: &mut Option<(io::ErrorKind, String)>, err: io::Error) -> io::Error {
    *stored = Some((err.kind(), err.to_string()));
    err
}

fn stored_err(stored: &Option<(io::ErrorKind, String)>) -> Option<io::Error> {
    stored.as_ref().map(|(kind, msg)| io::Error::new(*kind, msg.clone()))
}

impl <T: AsyncRead + AsyncWrite + Unpin> AsyncRead for ReadWriter<T> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.plain_in.is_empty() {
            this.take_plain(buf);
            return Poll::Ready(Ok(()));
        }
        if let Some(err) = stored_err(&this.read_err) {
            return Poll::Ready(Err(err));
        }

        loop {
            let frame = match ready!(this.poll_read_frame(cx)) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Poll::Ready(Ok(())),
                Err(e) => return Poll::Ready(Err(permanent(&mut this.read_err, e))),
            };
            match this.noise.decrypt(&frame) {
                Ok(plain) => {
                    trace!(len = plain.len(), "decrypted frame");
                    if plain.is_empty() {
                        continue;
                    }
                    this.plain_in = plain.into();
                    this.take_plain(buf);
                    return Poll::Ready(Ok(()));
                }
                Err(e) => {
                    let err = io::Error::new(io::ErrorKind::InvalidData, e);
                    return Poll::Ready(Err(permanent(&mut this.read_err, err)));
                }
            }
        }
    }
}

impl <T: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ReadWriter<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if let Some(err) = stored_err(&this.write_err) {
            return Poll::Ready(Err(err));
        }
        if let Err(e) = ready!(this.poll_write_raw(cx)) {
            return Poll::Ready(Err(permanent(&mut this.write_err, e)));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_FRAME_PAYLOAD);
        let ciphertext = match this.noise.encrypt(&buf[..n]) {
            Ok(ct) => ct,
            Err(e) => return Poll::Ready(Err(permanent(&mut this.write_err, io::Error::new(io::ErrorKind::Other, e)))),
        };
        this.raw_out.put_u16(ciphertext.len() as u16);
        this.raw_out.put_slice(&ciphertext);

        // the frame is accepted at this point, the rest is done by subsequent writes or flush
        if let Poll::Ready(Err(e)) = this.poll_write_raw(cx) {
            return Poll::Ready(Err(permanent(&mut this.write_err, e)));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Err(e) = ready!(this.poll_write_raw(cx)) {
            return Poll::Ready(Err(permanent(&mut this.write_err, e)));
        }
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_raw(cx))?;
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}
