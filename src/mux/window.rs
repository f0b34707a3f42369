use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

use bytes::{Buf, Bytes};
use tokio::io::ReadBuf;
use tracing::trace;

use crate::error::DmsgError;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};


/// Inbound side of a sub-stream's flow control: data the peer sent that was not read yet. The
///  peer may send `max` bytes without acknowledgement, so this is the upper bound for buffered data.
///  Reading data acknowledges it to the peer.
///
/// Invariant: `remaining + buffered == max`
pub struct LocalWindow {
    inner: Mutex<LocalInner>,
    send_ack: Box<dyn Fn(u32) + Send + Sync>,
}

struct LocalInner {
    remaining: u32,
    max: u32,
    buf: VecDeque<Bytes>,
    done: bool,
    waker: Option<Waker>,
}

impl LocalWindow {
    /// `send_ack` is called after every successful read with the number of bytes read. It must
    ///  not block.
    pub fn new(max: u32, send_ack: impl Fn(u32) + Send + Sync + 'static) -> LocalWindow {
        LocalWindow {
            inner: Mutex::new(LocalInner {
                remaining: max,
                max,
                buf: VecDeque::new(),
                done: false,
                waker: None,
            }),
            send_ack: Box::new(send_ack),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.lock().remaining
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalInner> {
        // no code panics while holding the lock except for invariant violations
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a data frame received from the peer. Fails if the peer sent more than the window
    ///  allows, leaving the window unchanged - this is a protocol violation, and the connection
    ///  should be torn down.
    pub fn enqueue(&self, payload: Bytes) -> Result<(), DmsgError> {
        let mut inner = self.lock();
        if payload.len() > inner.remaining.safe_cast() {
            return Err(DmsgError::WindowExceeded);
        }
        if payload.is_empty() {
            return Ok(());
        }

        let len: u32 = payload.len().prechecked_cast();
        inner.remaining -= len;
        inner.buf.push_back(payload);
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
        Ok(())
    }

    /// Copies buffered data into `buf`, returning the number of bytes copied. Zero means end of
    ///  stream, which happens only after the window was closed and all data was read.
    pub fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<usize> {
        if buf.remaining() == 0 {
            return Poll::Ready(0);
        }

        let n = {
            let mut inner = self.lock();
            if inner.buf.is_empty() {
                if inner.done && inner.remaining == inner.max {
                    return Poll::Ready(0);
                }
                inner.waker = Some(cx.waker().clone());
                return Poll::Pending;
            }

            let mut n = 0;
            while buf.remaining() > 0 {
                let Some(chunk) = inner.buf.front_mut() else { break };
                let len = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..len]);
                chunk.advance(len);
                if chunk.is_empty() {
                    inner.buf.pop_front();
                }
                n += len;
            }

            let n_u32: u32 = n.prechecked_cast();
            inner.remaining = match inner.remaining.checked_add(n_u32) {
                Some(r) if r <= inner.max => r,
                _ => panic!("local window out of bounds: remaining {} + {} > max {}", inner.remaining, n, inner.max),
            };
            n_u32
        };

        trace!(n, "read from local window");
        (self.send_ack)(n);
        Poll::Ready(n.safe_cast())
    }

    pub async fn read(&self, buf: &mut [u8]) -> usize {
        let mut read_buf = ReadBuf::new(buf);
        poll_fn(|cx| self.poll_read(cx, &mut read_buf)).await
    }

    /// No more data is going to arrive. Readers get end-of-stream once they consumed what is
    ///  already buffered.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.done = true;
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
    }
}


/// Outbound side of a sub-stream's flow control: how much the peer is still willing to buffer
pub struct RemoteWindow {
    inner: Mutex<RemoteInner>,
    write_lock: tokio::sync::Mutex<()>,
}

struct RemoteInner {
    remaining: u32,
    max: u32,
    closed: bool,
    waker: Option<Waker>,
}

impl RemoteWindow {
    pub fn new(max: u32) -> RemoteWindow {
        RemoteWindow {
            inner: Mutex::new(RemoteInner {
                remaining: max,
                max,
                closed: false,
                waker: None,
            }),
            write_lock: Default::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RemoteInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn remaining(&self) -> u32 {
        self.lock().remaining
    }

    /// The peer acknowledged `n` bytes. Acknowledging more than was sent is a protocol violation.
    pub fn grow(&self, n: u32) -> Result<(), DmsgError> {
        let mut inner = self.lock();
        match inner.remaining.checked_add(n) {
            Some(r) if r <= inner.max => inner.remaining = r,
            _ => return Err(DmsgError::WindowExceeded),
        }
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
        Ok(())
    }

    /// Waits until the peer has window space, and takes up to `wanted` bytes (but at most
    ///  `max_chunk`) of it. The caller must send exactly that many bytes.
    pub fn poll_reserve(&self, cx: &mut Context<'_>, wanted: usize, max_chunk: usize) -> Poll<io::Result<usize>> {
        let mut inner = self.lock();
        if inner.closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if inner.remaining == 0 {
            inner.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let chunk = wanted.min(max_chunk).min(inner.remaining.safe_cast());
        let chunk_u32: u32 = chunk.prechecked_cast();
        assert!(chunk_u32 <= inner.remaining, "remote window out of bounds");
        inner.remaining -= chunk_u32;
        Poll::Ready(Ok(chunk))
    }

    /// Sends all of `payload` through `send`, in chunks no bigger than the remote window and
    ///  `max_chunk`, waiting for acknowledgements whenever the window is exhausted. Concurrent
    ///  writes are serialized.
    pub async fn write(&self, payload: &[u8], max_chunk: usize, mut send: impl FnMut(Bytes) -> io::Result<()>) -> io::Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut offs = 0;
        while offs < payload.len() {
            let chunk = poll_fn(|cx| self.poll_reserve(cx, payload.len() - offs, max_chunk)).await?;
            send(Bytes::copy_from_slice(&payload[offs..offs+chunk]))?;
            offs += chunk;
        }
        Ok(())
    }

    /// Fails pending and subsequent writes
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rstest::rstest;
    use tokio::time::timeout;
    use super::*;

    fn recording_window(max: u32) -> (LocalWindow, Arc<Mutex<Vec<u32>>>) {
        let acks = Arc::new(Mutex::new(Vec::new()));
        let acks2 = acks.clone();
        (LocalWindow::new(max, move |n| acks2.lock().unwrap().push(n)), acks)
    }

    #[rstest]
    #[case::fits(10, vec![4, 6], 0)]
    #[case::partial(10, vec![3], 7)]
    #[case::empty_frame(10, vec![0], 10)]
    fn test_enqueue(#[case] max: u32, #[case] frames: Vec<usize>, #[case] expected_remaining: u32) {
        let (window, _) = recording_window(max);
        for len in frames {
            window.enqueue(Bytes::from(vec![1; len])).unwrap();
        }
        assert_eq!(window.remaining(), expected_remaining);
    }

    #[rstest]
    #[case::single_frame_too_big(10, vec![], 11)]
    #[case::cumulative(10, vec![6], 5)]
    #[case::full(10, vec![10], 1)]
    fn test_enqueue_exceeding_window(#[case] max: u32, #[case] before: Vec<usize>, #[case] offending: usize) {
        let (window, _) = recording_window(max);
        for len in before {
            window.enqueue(Bytes::from(vec![1; len])).unwrap();
        }
        let remaining_before = window.remaining();

        assert_eq!(window.enqueue(Bytes::from(vec![1; offending])), Err(DmsgError::WindowExceeded));
        assert_eq!(window.remaining(), remaining_before);
        assert_eq!(window.lock().buf.iter().map(|b| b.len()).sum::<usize>(), (max - remaining_before) as usize);
    }

    #[tokio::test]
    async fn test_read_acks_and_restores_window() {
        let (window, acks) = recording_window(10);
        window.enqueue(Bytes::from_static(b"abc")).unwrap();
        window.enqueue(Bytes::from_static(b"defg")).unwrap();
        assert_eq!(window.remaining(), 3);

        let mut buf = [0u8; 5];
        assert_eq!(window.read(&mut buf).await, 5);
        assert_eq!(&buf, b"abcde");
        assert_eq!(window.remaining(), 8);

        assert_eq!(window.read(&mut buf).await, 2);
        assert_eq!(&buf[..2], b"fg");
        assert_eq!(window.remaining(), 10);

        assert_eq!(*acks.lock().unwrap(), vec![5, 2]);
    }

    #[tokio::test]
    async fn test_read_blocks_until_enqueue() {
        let (window, _) = recording_window(10);
        let window = Arc::new(window);

        let w2 = window.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 10];
            let n = w2.read(&mut buf).await;
            buf[..n].to_vec()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        window.enqueue(Bytes::from_static(b"xy")).unwrap();
        assert_eq!(timeout(Duration::from_secs(1), reader).await.unwrap().unwrap(), b"xy".to_vec());
    }

    #[tokio::test]
    async fn test_eof_only_after_drained() {
        let (window, _) = recording_window(10);
        window.enqueue(Bytes::from_static(b"xyz")).unwrap();
        window.close();

        let mut buf = [0u8; 2];
        assert_eq!(window.read(&mut buf).await, 2);
        assert_eq!(window.read(&mut buf).await, 1);
        assert_eq!(window.read(&mut buf).await, 0);
        assert_eq!(window.read(&mut buf).await, 0);
    }

    #[tokio::test]
    async fn test_close_wakes_reader() {
        let window = Arc::new(recording_window(10).0);
        let w2 = window.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 10];
            w2.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        window.close();
        assert_eq!(timeout(Duration::from_secs(1), reader).await.unwrap().unwrap(), 0);
    }

    #[rstest]
    #[case::to_max(10, 4, 4, Ok(()))]
    #[case::partial(10, 4, 2, Ok(()))]
    #[case::beyond_max(10, 4, 5, Err(DmsgError::WindowExceeded))]
    #[case::nothing_sent(10, 0, 1, Err(DmsgError::WindowExceeded))]
    #[tokio::test]
    async fn test_grow(#[case] max: u32, #[case] sent: usize, #[case] acked: u32, #[case] expected: Result<(), DmsgError>) {
        let window = RemoteWindow::new(max);
        if sent > 0 {
            let reserved = poll_fn(|cx| window.poll_reserve(cx, sent, 100)).await.unwrap();
            assert_eq!(reserved, sent);
        }
        let before = window.remaining();
        assert_eq!(window.grow(acked), expected);
        if expected.is_err() {
            assert_eq!(window.remaining(), before);
        }
    }

    #[rstest]
    #[case::window_limited(4, 100, 10, vec![4, 4, 2])]
    #[case::chunk_limited(100, 3, 10, vec![3, 3, 3, 1])]
    #[case::exact(10, 10, 10, vec![10])]
    #[tokio::test]
    async fn test_write_chunks_and_blocks(#[case] max: u32, #[case] max_chunk: usize, #[case] len: usize, #[case] expected_chunks: Vec<usize>) {
        let window = Arc::new(RemoteWindow::new(max));
        let sent = Arc::new(Mutex::new(Vec::new()));

        // acknowledge everything the 'peer' receives after a while
        let w2 = window.clone();
        let sent2 = sent.clone();
        let writer = tokio::spawn(async move {
            let payload = vec![7u8; len];
            w2.write(&payload, max_chunk, |chunk| {
                sent2.lock().unwrap().push(chunk.len());
                Ok(())
            }).await
        });

        let mut acked = 0;
        while acked < len {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let total_sent: usize = sent.lock().unwrap().iter().sum();
            if total_sent > acked {
                window.grow((total_sent - acked) as u32).unwrap();
                acked = total_sent;
            }
        }

        timeout(Duration::from_secs(1), writer).await.unwrap().unwrap().unwrap();
        assert_eq!(*sent.lock().unwrap(), expected_chunks);
        assert_eq!(window.remaining(), max);
    }

    #[tokio::test]
    async fn test_write_blocks_without_ack() {
        let window = Arc::new(RemoteWindow::new(4));
        let w2 = window.clone();
        let writer = tokio::spawn(async move {
            w2.write(&[1; 10], 100, |_| Ok(())).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());
        assert_eq!(window.remaining(), 0);

        window.close();
        let result = timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }
}
