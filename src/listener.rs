use std::sync::{Arc, Mutex, Weak};

use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::addr::Addr;
use crate::error::DmsgError;
use crate::porter::{PortGuard, Porter};
use crate::stream::Stream;

/// What a client's ports are occupied by
#[derive(Clone)]
pub enum PortValue {
    Listener(Weak<ListenerShared>),
    /// the local end of a dialed stream
    Stream,
}

impl PortValue {
    pub(crate) fn listener(&self) -> Option<Arc<ListenerShared>> {
        match self {
            PortValue::Listener(l) => l.upgrade(),
            PortValue::Stream => None,
        }
    }
}


pub struct ListenerShared {
    addr: Addr,
    tx: mpsc::Sender<Stream>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
    closed: CancellationToken,
    port: Mutex<Option<PortGuard>>,
}

impl ListenerShared {
    /// Takes a slot in the accept queue for a stream that is being handshaked, failing if the
    ///  queue is full
    pub(crate) fn try_reserve_slot(&self) -> Result<mpsc::OwnedPermit<Stream>, DmsgError> {
        if self.closed.is_cancelled() {
            return Err(DmsgError::ReqNoListener);
        }
        match self.tx.clone().try_reserve_owned() {
            Ok(permit) => Ok(permit),
            Err(TrySendError::Full(_)) => Err(DmsgError::AcceptBufferFull),
            Err(TrySendError::Closed(_)) => Err(DmsgError::ReqNoListener),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        debug!(addr = %self.addr.short(), "closing listener");

        if let Some(port) = self.port.lock().unwrap_or_else(|e| e.into_inner()).take() {
            port.release();
        }
        // an accept call in progress holds the lock - it returns because of the cancellation,
        //  and queued streams are dropped with the listener
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
            while let Ok(stream) = rx.try_recv() {
                stream.close();
            }
        }
    }
}


/// Accepts inbound streams on one of a client's ports. Closing or dropping it frees the port.
pub struct Listener {
    shared: Arc<ListenerShared>,
}

impl Listener {
    pub(crate) fn bind(porter: &Porter<PortValue>, addr: Addr, accept_buffer_size: usize) -> anyhow::Result<Listener> {
        let (tx, rx) = mpsc::channel(accept_buffer_size);
        let shared = Arc::new(ListenerShared {
            addr,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
            port: Mutex::new(None),
        });

        let guard = porter.reserve(addr.port, PortValue::Listener(Arc::downgrade(&shared)))?;
        *shared.port.lock().unwrap_or_else(|e| e.into_inner()) = Some(guard);
        debug!(addr = %addr.short(), "listening");
        Ok(Listener { shared })
    }

    pub fn addr(&self) -> Addr {
        self.shared.addr
    }

    pub async fn accept_stream(&self) -> anyhow::Result<Stream> {
        let mut rx = select! {
            _ = self.shared.closed.cancelled() => return Err(DmsgError::ListenerClosed.into()),
            rx = self.shared.rx.lock() => rx,
        };
        select! {
            _ = self.shared.closed.cancelled() => Err(DmsgError::ListenerClosed.into()),
            stream = rx.recv() => stream.ok_or_else(|| DmsgError::ListenerClosed.into()),
        }
    }

    /// Frees the port and closes streams that were not accepted yet. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// closes the listener behind a port value, if any
pub(crate) fn close_listener(value: &PortValue) {
    if let Some(l) = value.listener() {
        l.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_util::keys::test_pk;

    #[tokio::test]
    async fn test_port_occupied() {
        let porter = Porter::new();
        let l1 = Listener::bind(&porter, Addr::new(test_pk(1), 80), 20).unwrap();

        let err = Listener::bind(&porter, Addr::new(test_pk(1), 80), 20).err().unwrap();
        assert_eq!(DmsgError::of(&err), Some(&DmsgError::PortOccupied(80)));

        assert!(!l1.is_closed());
        assert!(porter.lookup(80).and_then(|v| v.listener()).is_some());
    }

    #[tokio::test]
    async fn test_close_frees_port() {
        let porter = Porter::new();
        let l1 = Listener::bind(&porter, Addr::new(test_pk(1), 80), 20).unwrap();
        l1.close();
        l1.close();
        assert!(!porter.is_occupied(80));

        let _l2 = Listener::bind(&porter, Addr::new(test_pk(1), 80), 20).unwrap();
    }

    #[tokio::test]
    async fn test_drop_frees_port() {
        let porter = Porter::new();
        drop(Listener::bind(&porter, Addr::new(test_pk(1), 80), 20).unwrap());
        assert!(!porter.is_occupied(80));
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let porter = Porter::new();
        let listener = Arc::new(Listener::bind(&porter, Addr::new(test_pk(1), 80), 20).unwrap());

        let l2 = listener.clone();
        let accepting = tokio::spawn(async move { l2.accept_stream().await.err().unwrap() });
        tokio::time::sleep(Duration::from_millis(10)).await;

        listener.close();
        let err = tokio::time::timeout(Duration::from_secs(1), accepting).await.unwrap().unwrap();
        assert_eq!(DmsgError::of(&err), Some(&DmsgError::ListenerClosed));
    }

    #[tokio::test]
    async fn test_accept_buffer_full() {
        let porter = Porter::new();
        let listener = Listener::bind(&porter, Addr::new(test_pk(1), 80), 2).unwrap();

        let _p1 = listener.shared.try_reserve_slot().unwrap();
        let _p2 = listener.shared.try_reserve_slot().unwrap();
        assert_eq!(listener.shared.try_reserve_slot().err(), Some(DmsgError::AcceptBufferFull));

        listener.close();
        assert_eq!(listener.shared.try_reserve_slot().err(), Some(DmsgError::ReqNoListener));
    }
}
