use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::trace;

use crate::mux::frame::Frame;
use crate::mux::session::SessionShared;
use crate::mux::window::{LocalWindow, RemoteWindow};


pub(crate) struct StreamShared {
    pub id: u32,
    pub local: LocalWindow,
    pub remote: RemoteWindow,
    out_tx: mpsc::UnboundedSender<Frame>,
    max_data_frame_size: usize,
    closed: AtomicBool,
    session: Weak<SessionShared>,
}

impl StreamShared {
    pub fn new(id: u32, window_size: u32, max_data_frame_size: usize, out_tx: mpsc::UnboundedSender<Frame>, session: Weak<SessionShared>) -> StreamShared {
        let ack_tx = out_tx.clone();
        StreamShared {
            id,
            local: LocalWindow::new(window_size, move |n| {
                // the session may be gone, and then there is nobody to ack to
                let _ = ack_tx.send(Frame::ack(id, n));
            }),
            remote: RemoteWindow::new(window_size),
            out_tx,
            max_data_frame_size,
            closed: AtomicBool::new(false),
            session,
        }
    }

    /// The peer closed the sub-stream, or the session went away
    pub fn on_remote_close(&self) {
        self.closed.store(true, Ordering::Release);
        self.local.close();
        self.remote.close();
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(stream_id = self.id, "closing sub-stream");
        let _ = self.out_tx.send(Frame::close(self.id));
        self.local.close();
        self.remote.close();
        if let Some(session) = self.session.upgrade() {
            session.remove_stream(self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}


/// One independent, flow controlled, bidirectional byte stream inside a multiplexed session.
///  Dropping it closes it.
pub struct MuxStream {
    shared: Arc<StreamShared>,
}

impl MuxStream {
    pub(crate) fn new(shared: Arc<StreamShared>) -> MuxStream {
        MuxStream { shared }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Closes both directions. Buffered inbound data remains readable. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        ready!(self.shared.local.poll_read(cx, buf));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let shared = &self.shared;
        let n = ready!(shared.remote.poll_reserve(cx, buf.len(), shared.max_data_frame_size))?;
        if shared.out_tx.send(Frame::data(shared.id, Bytes::copy_from_slice(&buf[..n]))).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.close();
        Poll::Ready(Ok(()))
    }
}
