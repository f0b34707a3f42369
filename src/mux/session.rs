use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::anyhow;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument, Span};

use crate::config::MuxConfig;
use crate::error::DmsgError;
use crate::mux::frame::{Frame, FrameType};
use crate::mux::stream::{MuxStream, StreamShared};
use crate::util::safe_converter::SafeCast;

/// Replies to frames the peer sent (pongs, refusals of sub-streams) that may be queued while the
///  connection is not writable
const MAX_QUEUED_REPLIES: usize = 256;

/// Determines sub-stream id parity so both sides can open sub-streams without coordination
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MuxRole {
    /// the side that dialed the connection, opening odd ids
    Client,
    /// the side that accepted the connection, opening even ids
    Server,
}

impl MuxRole {
    fn first_id(&self) -> u32 {
        match self {
            MuxRole::Client => 1,
            MuxRole::Server => 2,
        }
    }

    fn is_peer_id(&self, id: u32) -> bool {
        match self {
            MuxRole::Client => id % 2 == 0 && id != 0,
            MuxRole::Server => id % 2 == 1,
        }
    }
}


pub(crate) struct SessionShared {
    config: MuxConfig,
    role: MuxRole,
    out_tx: mpsc::UnboundedSender<Frame>,
    reply_tx: mpsc::Sender<Frame>,
    streams: Mutex<FxHashMap<u32, Arc<StreamShared>>>,
    next_id: AtomicU32,
    accept_tx: mpsc::Sender<MuxStream>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    pings: Mutex<FxHashMap<u32, oneshot::Sender<()>>>,
    next_ping: AtomicU32,
    cancel: CancellationToken,
    close_result: OnceLock<Result<(), String>>,
}

impl SessionShared {
    pub fn remove_stream(&self, id: u32) {
        self.lock_streams().remove(&id);
    }

    fn lock_streams(&self) -> std::sync::MutexGuard<'_, FxHashMap<u32, Arc<StreamShared>>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn new_stream(self: &Arc<Self>, id: u32) -> Arc<StreamShared> {
        Arc::new(StreamShared::new(
            id,
            self.config.window_size,
            self.config.max_data_frame_size.safe_cast(),
            self.out_tx.clone(),
            Arc::downgrade(self),
        ))
    }

    /// Ends the session: all sub-streams see end-of-stream, and I/O tasks stop. Idempotent.
    fn terminate(&self) {
        self.cancel.cancel();
        let streams = std::mem::take(&mut *self.lock_streams());
        for stream in streams.values() {
            stream.on_remote_close();
        }
        self.pings.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame) -> anyhow::Result<()> {
        trace!(frame_type = ?frame.frame_type, stream_id = frame.stream_id, len = frame.payload.len(), "received frame");

        match frame.frame_type {
            FrameType::Open => {
                if !self.role.is_peer_id(frame.stream_id) {
                    return Err(anyhow!("peer opened sub-stream with invalid id {}", frame.stream_id));
                }
                let stream = self.new_stream(frame.stream_id);
                {
                    let mut streams = self.lock_streams();
                    if streams.contains_key(&frame.stream_id) {
                        return Err(anyhow!("peer opened sub-stream {} twice", frame.stream_id));
                    }
                    streams.insert(frame.stream_id, stream.clone());
                }
                if let Err(e) = self.accept_tx.try_send(MuxStream::new(stream.clone())) {
                    warn!("refusing sub-stream {}: {}", frame.stream_id, e);
                    self.remove_stream(frame.stream_id);
                    // marks the sub-stream closed so that dropping it does not queue another frame
                    stream.on_remote_close();
                    drop(e);
                    if let Err(mpsc::error::TrySendError::Full(_)) = self.reply_tx.try_send(Frame::close(frame.stream_id)) {
                        return Err(anyhow!("peer keeps opening sub-streams without reading replies"));
                    }
                }
            }
            FrameType::Data => {
                let stream = self.lock_streams().get(&frame.stream_id).cloned();
                match stream {
                    Some(stream) => stream.local.enqueue(frame.payload)?,
                    None => trace!(stream_id = frame.stream_id, "dropping data for closed sub-stream"),
                }
            }
            FrameType::Ack => {
                let n = frame.ack_value()?;
                let stream = self.lock_streams().get(&frame.stream_id).cloned();
                if let Some(stream) = stream {
                    stream.remote.grow(n)?;
                }
            }
            FrameType::Close => {
                let stream = self.lock_streams().remove(&frame.stream_id);
                if let Some(stream) = stream {
                    stream.on_remote_close();
                }
            }
            FrameType::Ping => {
                if let Err(mpsc::error::TrySendError::Full(_)) = self.reply_tx.try_send(Frame::pong(frame.stream_id)) {
                    trace!(nonce = frame.stream_id, "reply queue full, dropping pong");
                }
            }
            FrameType::Pong => {
                let waiting = self.pings.lock().unwrap_or_else(|e| e.into_inner()).remove(&frame.stream_id);
                if let Some(tx) = waiting {
                    let _ = tx.send(());
                }
            }
        }
        Ok(())
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        self.terminate();
    }
}


/// Multiplexes independent sub-streams over a single connection. This is a handle - clones refer
///  to the same session.
///
/// The connection is driven by two tasks: a reader dispatching incoming frames to sub-streams, and
///  a writer sending queued frames. Data frames are bounded by each sub-stream's remote window,
///  and acks by the data read locally. Replies triggered by the peer go through a separate bounded
///  queue: pongs are dropped when it is full, and a peer that keeps opening sub-streams beyond the
///  accept backlog without reading gets its session closed.
#[derive(Clone)]
pub struct MuxSession {
    shared: Arc<SessionShared>,
}

impl MuxSession {
    pub fn new<T: AsyncRead + AsyncWrite + Send + 'static>(conn: T, role: MuxRole, config: MuxConfig) -> MuxSession {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::channel(MAX_QUEUED_REPLIES);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);

        let shared = Arc::new(SessionShared {
            role,
            out_tx,
            reply_tx,
            streams: Default::default(),
            next_id: AtomicU32::new(role.first_id()),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            pings: Default::default(),
            next_ping: AtomicU32::new(1),
            cancel: CancellationToken::new(),
            close_result: OnceLock::new(),
            config,
        });

        let (read_half, write_half) = tokio::io::split(conn);
        tokio::spawn(Self::read_loop(Arc::downgrade(&shared), shared.cancel.clone(), shared.config.max_data_frame_size.safe_cast(), read_half)
            .instrument(Span::current()));
        tokio::spawn(Self::write_loop(shared.cancel.clone(), out_rx, reply_rx, write_half)
            .instrument(Span::current()));

        MuxSession { shared }
    }

    async fn read_loop<T: AsyncRead>(shared: std::sync::Weak<SessionShared>, cancel: CancellationToken, max_payload: usize, mut reader: ReadHalf<T>) {
        loop {
            let frame = select! {
                _ = cancel.cancelled() => break,
                frame = Frame::read_from(&mut reader, max_payload) => frame,
            };
            let Some(shared) = shared.upgrade() else { break };

            match frame {
                Ok(Some(frame)) => {
                    if let Err(e) = shared.handle_frame(frame) {
                        warn!("protocol violation, closing session: {}", e);
                        shared.terminate();
                        break;
                    }
                }
                Ok(None) => {
                    debug!("connection closed by peer");
                    shared.terminate();
                    break;
                }
                Err(e) => {
                    debug!("error reading from connection: {}", e);
                    shared.terminate();
                    break;
                }
            }
        }
        trace!("read loop terminated");
    }

    async fn write_loop<T: AsyncWrite>(cancel: CancellationToken, mut out_rx: mpsc::UnboundedReceiver<Frame>, mut reply_rx: mpsc::Receiver<Frame>, mut writer: WriteHalf<T>) {
        let mut buf = BytesMut::new();
        loop {
            let frame = select! {
                _ = cancel.cancelled() => break,
                frame = out_rx.recv() => frame,
                frame = reply_rx.recv() => frame,
            };
            let Some(frame) = frame else { break };

            buf.clear();
            frame.ser(&mut buf);
            // batch what is queued anyway
            while buf.len() < 64*1024 {
                match out_rx.try_recv() {
                    Ok(frame) => frame.ser(&mut buf),
                    Err(_) => break,
                }
            }
            while buf.len() < 64*1024 {
                match reply_rx.try_recv() {
                    Ok(frame) => frame.ser(&mut buf),
                    Err(_) => break,
                }
            }

            let result = async {
                writer.write_all(&buf).await?;
                writer.flush().await
            }.await;
            if let Err(e) = result {
                debug!("error writing to connection: {}", e);
                cancel.cancel();
                break;
            }
        }
        let _ = writer.shutdown().await;
        trace!("write loop terminated");
    }

    pub fn role(&self) -> MuxRole {
        self.shared.role
    }

    pub fn open_stream(&self) -> anyhow::Result<MuxStream> {
        if self.is_closed() {
            return Err(DmsgError::SessionClosed.into());
        }

        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = self.shared.new_stream(id);
        self.shared.lock_streams().insert(id, stream.clone());
        if self.shared.out_tx.send(Frame::open(id)).is_err() {
            self.shared.remove_stream(id);
            return Err(DmsgError::SessionClosed.into());
        }
        trace!(stream_id = id, "opened sub-stream");
        Ok(MuxStream::new(stream))
    }

    pub async fn accept_stream(&self) -> anyhow::Result<MuxStream> {
        let mut accept_rx = select! {
            _ = self.shared.cancel.cancelled() => return Err(DmsgError::SessionClosed.into()),
            rx = self.shared.accept_rx.lock() => rx,
        };
        select! {
            _ = self.shared.cancel.cancelled() => Err(DmsgError::SessionClosed.into()),
            stream = accept_rx.recv() => stream.ok_or_else(|| DmsgError::SessionClosed.into()),
        }
    }

    /// round trip time to the peer
    pub async fn ping(&self, timeout: Duration) -> anyhow::Result<Duration> {
        let nonce = self.shared.next_ping.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pings.lock().unwrap_or_else(|e| e.into_inner()).insert(nonce, tx);

        let start = Instant::now();
        if self.shared.out_tx.send(Frame::ping(nonce)).is_err() {
            return Err(DmsgError::SessionClosed.into());
        }
        let result = select! {
            _ = self.shared.cancel.cancelled() => Err(DmsgError::SessionClosed.into()),
            _ = tokio::time::sleep(timeout) => Err(anyhow::Error::new(std::io::Error::from(std::io::ErrorKind::TimedOut))),
            pong = rx => pong.map(|_| start.elapsed()).map_err(|_| DmsgError::SessionClosed.into()),
        };
        self.shared.pings.lock().unwrap_or_else(|e| e.into_inner()).remove(&nonce);
        result
    }

    pub fn num_streams(&self) -> usize {
        self.shared.lock_streams().len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// resolves when the session is closed, either locally or because the connection ended
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }

    /// Closes the session and the underlying connection. Idempotent: Only the first call has an
    ///  effect, and all calls return its result.
    pub fn close(&self) -> anyhow::Result<()> {
        let result = self.shared.close_result.get_or_init(|| {
            debug!("closing session");
            self.shared.terminate();
            Ok(())
        });
        result.clone().map_err(|e| anyhow!(e))
    }
}
