use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::cipher::{PublicKey, SecretKey};
use crate::config::MuxConfig;
use crate::error::DmsgError;
use crate::mux::{MuxRole, MuxSession, MuxStream};
use crate::noise::{Noise, ReadWriter};


/// One encrypted, multiplexed connection between a client and a server. This is a handle - clones
///  refer to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    local_pk: PublicKey,
    remote_pk: PublicKey,
    remote_addr: Option<SocketAddr>,
    mux: MuxSession,
}

impl Session {
    /// Connects to a server at a network address, authenticating it as `remote_pk`
    pub async fn dial(sk: &SecretKey, remote_pk: PublicKey, addr: &str, timeout: Duration, mux_config: MuxConfig) -> anyhow::Result<Session> {
        let tcp = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(tcp) => tcp?,
            Err(_) => return Err(DmsgError::HandshakeTimeout.into()),
        };
        tcp.set_nodelay(true)?;
        let remote_addr = tcp.peer_addr().ok();
        Self::initiate(tcp, remote_addr, sk, remote_pk, timeout, mux_config).await
    }

    /// Session handshake as the initiator (client) over an established connection
    pub async fn initiate<T>(conn: T, remote_addr: Option<SocketAddr>, sk: &SecretKey, remote_pk: PublicKey, timeout: Duration, mux_config: MuxConfig) -> anyhow::Result<Session>
    where T: AsyncRead + AsyncWrite + Unpin + Send + 'static
    {
        let mut rw = ReadWriter::new(conn, Noise::xk_initiator(sk, remote_pk)?);
        rw.handshake(timeout).await?;

        // the responder only writes after the initiator's final handshake message, so anything
        //  received with the handshake means the peer is out of sync
        if rw.buffered() > 0 {
            return Err(DmsgError::SessionHandshakeExtraBytes.into());
        }

        debug!(remote = %remote_pk.short(), "session established");
        Ok(Self::from_channel(sk.public_key(), remote_pk, remote_addr, rw, MuxRole::Client, mux_config))
    }

    /// Session handshake as the responder (server), learning the initiator's identity from the
    ///  handshake
    pub async fn respond<T>(conn: T, remote_addr: Option<SocketAddr>, sk: &SecretKey, timeout: Duration, mux_config: MuxConfig) -> anyhow::Result<Session>
    where T: AsyncRead + AsyncWrite + Unpin + Send + 'static
    {
        let mut rw = ReadWriter::new(conn, Noise::xk_responder(sk)?);
        rw.handshake(timeout).await?;

        let remote_pk = match rw.noise().remote_static() {
            Some(pk) if !pk.is_null() => pk,
            _ => return Err(DmsgError::HandshakeVerify("no remote static key after handshake".to_string()).into()),
        };

        debug!(remote = %remote_pk.short(), "session established");
        Ok(Self::from_channel(sk.public_key(), remote_pk, remote_addr, rw, MuxRole::Server, mux_config))
    }

    fn from_channel<T>(local_pk: PublicKey, remote_pk: PublicKey, remote_addr: Option<SocketAddr>, rw: ReadWriter<T>, role: MuxRole, mux_config: MuxConfig) -> Session
    where T: AsyncRead + AsyncWrite + Unpin + Send + 'static
    {
        Session {
            inner: Arc::new(SessionInner {
                local_pk,
                remote_pk,
                remote_addr,
                mux: MuxSession::new(rw, role, mux_config),
            }),
        }
    }

    pub fn local_pk(&self) -> PublicKey {
        self.inner.local_pk
    }

    pub fn remote_pk(&self) -> PublicKey {
        self.inner.remote_pk
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// a sub-stream carrying one stream handshake and the stream's data
    pub fn open_sub_stream(&self) -> anyhow::Result<MuxStream> {
        self.inner.mux.open_stream()
    }

    pub async fn accept_sub_stream(&self) -> anyhow::Result<MuxStream> {
        self.inner.mux.accept_stream().await
    }

    pub async fn ping(&self, timeout: Duration) -> anyhow::Result<Duration> {
        self.inner.mux.ping(timeout).await
    }

    pub fn num_sub_streams(&self) -> usize {
        self.inner.mux.num_streams()
    }

    /// Closes the multiplexer and the connection beneath it. Idempotent and safe to call
    ///  concurrently.
    pub fn close(&self) -> anyhow::Result<()> {
        self.inner.mux.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.mux.is_closed()
    }

    /// resolves when the session is closed locally or by the peer
    pub async fn closed(&self) {
        self.inner.mux.closed().await
    }

    /// `true` if both handles refer to the same session, as opposed to two sessions with the
    ///  same peer
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
