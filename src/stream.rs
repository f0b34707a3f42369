use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};
use tracing::{debug, instrument};

use crate::addr::Addr;
use crate::cipher::{SecretKey, Signature};
use crate::dial::{read_object, write_object, StreamDialRequest, StreamDialResponse, TimestampSource, TimestampTracker};
use crate::error::DmsgError;
use crate::listener::PortValue;
use crate::mux::MuxStream;
use crate::noise::{Noise, ReadWriter};
use crate::porter::{PortGuard, Porter};
use crate::session::Session;


/// A virtual connection between two clients, relayed by a server through a sub-stream of each
///  client's session. Payload is encrypted end to end, the relay only sees ciphertext.
///
/// Reads and writes can be given deadlines. Once a deadline passed, calls in that direction fail
///  with [io::ErrorKind::TimedOut] until the deadline is moved or removed.
///
/// Dropping a stream closes it.
pub struct Stream {
    local: Addr,
    remote: Addr,
    rw: ReadWriter<MuxStream>,
    /// the ephemeral port of a dialed stream
    port: Option<PortGuard>,
    closed: AtomicBool,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl Stream {
    fn new(local: Addr, remote: Addr, rw: ReadWriter<MuxStream>, port: Option<PortGuard>) -> Stream {
        Stream {
            local,
            remote,
            rw,
            port,
            closed: AtomicBool::new(false),
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Sets both the read and the write deadline, `None` removes them
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    /// applies to writes, flushes and shutdown
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    pub fn local_addr(&self) -> Addr {
        self.local
    }

    pub fn remote_addr(&self) -> Addr {
        self.remote
    }

    /// Closes both directions and releases the local port. Idempotent.
    ///
    /// Written data that is still buffered waiting for window space is discarded. Use
    ///  [AsyncWriteExt::shutdown](tokio::io::AsyncWriteExt::shutdown) to deliver it before closing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(local = %self.local.short(), remote = %self.remote.short(), "closing stream");
        self.rw.get_ref().close();
        if let Some(port) = &self.port {
            port.release();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.rw.get_ref().is_closed()
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, DmsgError::StreamClosed)
    }
}

/// fails once the deadline passed, registering for a wakeup at the deadline otherwise
fn poll_deadline(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> io::Result<()> {
    if let Some(sleep) = deadline {
        if sleep.as_mut().poll(cx).is_ready() {
            return Err(io::ErrorKind::TimedOut.into());
        }
    }
    Ok(())
}

impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        poll_deadline(&mut this.read_deadline, cx)?;
        Pin::new(&mut this.rw).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(Self::closed_error()));
        }
        poll_deadline(&mut this.write_deadline, cx)?;
        Pin::new(&mut this.rw).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(Self::closed_error()));
        }
        poll_deadline(&mut this.write_deadline, cx)?;
        Pin::new(&mut this.rw).poll_flush(cx)
    }

    /// delivers buffered data before closing
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.closed.load(Ordering::Acquire) {
            let flushed = match poll_deadline(&mut this.write_deadline, cx) {
                Ok(()) => ready!(Pin::new(&mut this.rw).poll_flush(cx)),
                Err(e) => Err(e),
            };
            if let Err(e) = flushed {
                this.close();
                return Poll::Ready(Err(e));
            }
        }
        this.close();
        Poll::Ready(Ok(()))
    }
}


/// Opens a stream to `dst` through `session`'s server: sends a signed dial request carrying the
///  first message of the stream handshake, and waits for the destination's signed answer.
#[instrument(skip_all, fields(dst = %dst.short()))]
pub(crate) async fn dial(session: &Session, sk: &SecretKey, porter: &Porter<PortValue>, timestamps: &TimestampSource, dst: Addr, timeout: Duration) -> anyhow::Result<Stream> {
    let (port, guard) = porter.reserve_ephemeral(PortValue::Stream)?;
    let local = Addr::new(session.local_pk(), port);

    let mut noise = Noise::kk(sk, dst.pk, true)?;
    let mut req = StreamDialRequest {
        timestamp: timestamps.next(),
        src: local,
        dst,
        noise_msg: Bytes::from(noise.make_handshake_message()?),
        signature: Signature::NULL,
    };
    req.sign(sk);

    let mut sub = session.open_sub_stream()?;
    let exchange = async {
        write_object(&mut sub, &req.to_bytes()).await?;
        let raw = read_object(&mut sub).await?;
        StreamDialResponse::try_deser(&mut raw.as_ref())
    };
    let resp = match tokio::time::timeout(timeout, exchange).await {
        Ok(resp) => resp?,
        Err(_) => return Err(DmsgError::HandshakeTimeout.into()),
    };

    // rejections from the relay are signed by the server at the other end of the session
    resp.verify(&dst.pk, &req.hash(), Some(&session.remote_pk()))?;
    noise.process_handshake_message(&resp.noise_msg)?;

    debug!(local = %local.short(), "stream established");
    Ok(Stream::new(local, dst, ReadWriter::new(sub, noise), Some(guard)))
}

/// Answers a dial request arriving on a sub-stream of `session`, handing the resulting stream to
///  the listener on the destination port. Rejected requests get a signed rejection, and the reason
///  is returned as the error.
#[instrument(skip_all, fields(server = %session.remote_pk().short()))]
pub(crate) async fn respond(mut sub: MuxStream, session: &Session, sk: &SecretKey, porter: &Porter<PortValue>, tracker: &TimestampTracker, timeout: Duration) -> anyhow::Result<()> {
    let raw = match tokio::time::timeout(timeout, read_object(&mut sub)).await {
        Ok(raw) => raw?,
        Err(_) => return Err(DmsgError::HandshakeTimeout.into()),
    };
    let req = StreamDialRequest::try_deser(&mut raw.as_ref())?;
    let req_hash = req.hash();

    match accept_request(&req, session, sk, porter, tracker) {
        Ok((permit, mut noise)) => {
            let resp = StreamDialResponse::accept(req_hash, Bytes::from(noise.make_handshake_message()?), sk);
            write_with_timeout(&mut sub, &resp, timeout).await?;

            debug!(local = %req.dst.short(), remote = %req.src.short(), "stream accepted");
            permit.send(Stream::new(req.dst, req.src, ReadWriter::new(sub, noise), None));
            Ok(())
        }
        Err(e) => {
            debug!(src = %req.src.short(), "rejecting dial request: {}", e);
            let resp = StreamDialResponse::reject(req_hash, &e, sk);
            write_with_timeout(&mut sub, &resp, timeout).await?;
            Err(e.into())
        }
    }
}

fn accept_request(req: &StreamDialRequest, session: &Session, sk: &SecretKey, porter: &Porter<PortValue>, tracker: &TimestampTracker) -> Result<(tokio::sync::mpsc::OwnedPermit<Stream>, Noise), DmsgError> {
    if req.dst.pk != session.local_pk() {
        return Err(DmsgError::ReqInvalidDstPk);
    }
    tracker.verify(req)?;

    let listener = porter.lookup(req.dst.port)
        .and_then(|v| v.listener())
        .ok_or(DmsgError::ReqNoListener)?;
    let permit = listener.try_reserve_slot()?;

    let to_dmsg_error = |e: anyhow::Error| DmsgError::of(&e)
        .cloned()
        .unwrap_or_else(|| DmsgError::HandshakeVerify(e.to_string()));
    let mut noise = Noise::kk(sk, req.src.pk, false).map_err(to_dmsg_error)?;
    noise.process_handshake_message(&req.noise_msg).map_err(to_dmsg_error)?;

    Ok((permit, noise))
}

async fn write_with_timeout(sub: &mut MuxStream, resp: &StreamDialResponse, timeout: Duration) -> anyhow::Result<()> {
    match tokio::time::timeout(timeout, write_object(sub, &resp.to_bytes())).await {
        Ok(result) => result,
        Err(_) => Err(DmsgError::HandshakeTimeout.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use super::*;
    use crate::listener::Listener;
    use crate::noise::read_writer::MAX_FRAME_PAYLOAD;
    use crate::session::tests::session_pair;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Two clients directly connected by a session, so that the 'server' side of the session is
    ///  itself the dial destination. This exercises the stream handshake without a relay.
    struct Setup {
        dialer: Session,
        dialer_sk: SecretKey,
        dialer_porter: Porter<PortValue>,
        timestamps: TimestampSource,
        responder_porter: Arc<Porter<PortValue>>,
        responder_task: tokio::task::JoinHandle<Vec<anyhow::Result<()>>>,
    }

    async fn setup(num_requests: usize) -> Setup {
        let (dialer, responder) = session_pair(1, 2).await;
        let responder_porter = Arc::new(Porter::new());

        let porter = responder_porter.clone();
        let responder_task = tokio::spawn(async move {
            let (_, sk) = crate::test_util::keys::test_key_pair(2);
            let tracker = TimestampTracker::default();
            let mut results = Vec::new();
            for _ in 0..num_requests {
                let sub = responder.accept_sub_stream().await.unwrap();
                results.push(respond(sub, &responder, &sk, &porter, &tracker, TIMEOUT).await);
            }
            results
        });

        Setup {
            dialer,
            dialer_sk: crate::test_util::keys::test_key_pair(1).1,
            dialer_porter: Porter::new(),
            timestamps: TimestampSource::default(),
            responder_porter,
            responder_task,
        }
    }

    impl Setup {
        async fn dial(&self, port: u16) -> anyhow::Result<Stream> {
            let dst = Addr::new(crate::test_util::keys::test_pk(2), port);
            dial(&self.dialer, &self.dialer_sk, &self.dialer_porter, &self.timestamps, dst, TIMEOUT).await
        }
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let setup = setup(1).await;
        let listener = Listener::bind(&setup.responder_porter, crate::test_util::keys::test_addr(2, 80), 20).unwrap();

        let mut dialed = setup.dial(80).await.unwrap();
        let mut accepted = listener.accept_stream().await.unwrap();

        assert_eq!(dialed.remote_addr(), accepted.local_addr());
        assert_eq!(dialed.local_addr(), accepted.remote_addr());
        assert!(dialed.local_addr().port >= 49152);
        assert!(setup.dialer_porter.is_occupied(dialed.local_addr().port));

        dialed.write_all(b"hello, world!").await.unwrap();
        let mut buf = [0u8; 13];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello, world!");

        accepted.write_all(b"back").await.unwrap();
        let mut buf = [0u8; 4];
        dialed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");

        let results = setup.responder_task.await.unwrap();
        assert!(results[0].is_ok());
    }

    #[tokio::test]
    async fn test_payload_is_encrypted_on_sub_stream() {
        let (dialer, responder) = session_pair(1, 2).await;
        let porter = Porter::new();
        let (_, sk_b) = crate::test_util::keys::test_key_pair(2);
        let _listener = Listener::bind(&porter, crate::test_util::keys::test_addr(2, 80), 20).unwrap();

        // answer the handshake by hand and then look at the raw sub-stream
        let responder_task = tokio::spawn(async move {
            let mut sub = responder.accept_sub_stream().await.unwrap();
            let raw = read_object(&mut sub).await.unwrap();
            let req = StreamDialRequest::try_deser(&mut raw.as_ref()).unwrap();
            let mut noise = Noise::kk(&sk_b, req.src.pk, false).unwrap();
            noise.process_handshake_message(&req.noise_msg).unwrap();
            let resp = StreamDialResponse::accept(req.hash(), Bytes::from(noise.make_handshake_message().unwrap()), &sk_b);
            write_object(&mut sub, &resp.to_bytes()).await.unwrap();

            let mut buf = vec![0u8; 2 + 13 + 16];
            sub.read_exact(&mut buf).await.unwrap();
            buf
        });

        let (_, sk_a) = crate::test_util::keys::test_key_pair(1);
        let mut stream = dial(&dialer, &sk_a, &Porter::new(), &TimestampSource::default(), crate::test_util::keys::test_addr(2, 80), TIMEOUT).await.unwrap();
        stream.write_all(b"hello, world!").await.unwrap();

        let raw = responder_task.await.unwrap();
        assert!(!raw.windows(13).any(|w| w == b"hello, world!"));
    }

    #[tokio::test]
    async fn test_no_listener() {
        let setup = setup(1).await;
        let err = setup.dial(80).await.err().unwrap();
        assert_eq!(DmsgError::of(&err), Some(&DmsgError::ReqNoListener));

        let results = setup.responder_task.await.unwrap();
        assert!(DmsgError::is(results[0].as_ref().err().unwrap(), &DmsgError::ReqNoListener));
    }

    #[tokio::test]
    async fn test_accept_buffer_full() {
        let setup = setup(2).await;
        let _listener = Listener::bind(&setup.responder_porter, crate::test_util::keys::test_addr(2, 80), 1).unwrap();

        let _first = setup.dial(80).await.unwrap();
        let err = setup.dial(80).await.err().unwrap();
        assert_eq!(DmsgError::of(&err), Some(&DmsgError::AcceptBufferFull));
    }

    #[tokio::test]
    async fn test_dialed_stream_releases_port() {
        let setup = setup(1).await;
        let listener = Listener::bind(&setup.responder_porter, crate::test_util::keys::test_addr(2, 80), 20).unwrap();

        let dialed = setup.dial(80).await.unwrap();
        let port = dialed.local_addr().port;
        dialed.close();
        dialed.close();
        assert!(dialed.is_closed());
        assert!(!setup.dialer_porter.is_occupied(port));

        let mut accepted = listener.accept_stream().await.unwrap();
        let mut buf = Vec::new();
        let n = tokio::time::timeout(TIMEOUT, accepted.read_to_end(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_shutdown_delivers_buffered_data() {
        let setup = setup(1).await;
        let listener = Listener::bind(&setup.responder_porter, crate::test_util::keys::test_addr(2, 80), 20).unwrap();

        let mut dialed = setup.dial(80).await.unwrap();
        let mut accepted = listener.accept_stream().await.unwrap();

        // more ciphertext than the initial window, so the last frame waits for acks
        let data = (0..4*MAX_FRAME_PAYLOAD).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let expected = data.clone();
        let writer = tokio::spawn(async move {
            dialed.write_all(&data).await.unwrap();
            dialed.shutdown().await.unwrap();
            dialed
        });

        let mut received = Vec::new();
        tokio::time::timeout(TIMEOUT, accepted.read_to_end(&mut received)).await.unwrap().unwrap();
        assert!(received == expected);

        let dialed = writer.await.unwrap();
        assert!(dialed.is_closed());
        assert!(!setup.dialer_porter.is_occupied(dialed.local_addr().port));
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let setup = setup(1).await;
        let listener = Listener::bind(&setup.responder_porter, crate::test_util::keys::test_addr(2, 80), 20).unwrap();
        let mut dialed = setup.dial(80).await.unwrap();
        let mut accepted = listener.accept_stream().await.unwrap();

        dialed.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
        let mut buf = [0u8; 4];
        let err = tokio::time::timeout(TIMEOUT, dialed.read(&mut buf)).await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        // stays expired until the deadline is changed
        assert_eq!(dialed.read(&mut buf).await.unwrap_err().kind(), io::ErrorKind::TimedOut);

        dialed.set_read_deadline(None);
        accepted.write_all(b"late").await.unwrap();
        dialed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"late");
    }

    #[tokio::test]
    async fn test_write_deadline() {
        let setup = setup(1).await;
        let listener = Listener::bind(&setup.responder_porter, crate::test_util::keys::test_addr(2, 80), 20).unwrap();
        let mut dialed = setup.dial(80).await.unwrap();
        let mut accepted = listener.accept_stream().await.unwrap();

        // nobody reads, so the window runs full and the write can not complete
        dialed.set_write_deadline(Some(Instant::now() + Duration::from_millis(50)));
        let data = vec![7u8; 1024*1024];
        let err = tokio::time::timeout(TIMEOUT, dialed.write_all(&data)).await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        dialed.set_deadline(None);
        let mut buf = [0u8; 16];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [7u8; 16]);
    }

    #[tokio::test]
    async fn test_write_after_close() {
        let setup = setup(1).await;
        let _listener = Listener::bind(&setup.responder_porter, crate::test_util::keys::test_addr(2, 80), 20).unwrap();

        let mut dialed = setup.dial(80).await.unwrap();
        dialed.close();
        let err = dialed.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_timeout() {
        let (dialer, _silent) = session_pair(1, 2).await;
        let (_, sk_a) = crate::test_util::keys::test_key_pair(1);

        let err = dial(&dialer, &sk_a, &Porter::new(), &TimestampSource::default(), crate::test_util::keys::test_addr(2, 80), TIMEOUT).await.err().unwrap();
        assert_eq!(DmsgError::of(&err), Some(&DmsgError::HandshakeTimeout));
    }

    #[tokio::test]
    async fn test_wrong_destination() {
        let (dialer, responder) = session_pair(1, 2).await;
        let porter = Porter::new();
        let _listener = Listener::bind(&porter, crate::test_util::keys::test_addr(2, 80), 20).unwrap();

        let responder_task = tokio::spawn(async move {
            let (_, sk) = crate::test_util::keys::test_key_pair(2);
            let sub = responder.accept_sub_stream().await.unwrap();
            respond(sub, &responder, &sk, &porter, &TimestampTracker::default(), TIMEOUT).await
        });

        // addressed to a third party, but answered by the session peer
        let (_, sk_a) = crate::test_util::keys::test_key_pair(1);
        let err = dial(&dialer, &sk_a, &Porter::new(), &TimestampSource::default(), crate::test_util::keys::test_addr(3, 80), TIMEOUT).await.err().unwrap();
        assert_eq!(DmsgError::of(&err), Some(&DmsgError::ReqInvalidDstPk));

        let responder_err = responder_task.await.unwrap().err().unwrap();
        assert_eq!(DmsgError::of(&responder_err), Some(&DmsgError::ReqInvalidDstPk));
    }
}
