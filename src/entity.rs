use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument, Span};

use crate::cipher::PublicKey;
use crate::session::Session;

/// Gets informed about changes to an entity's set of sessions, typically to publish them to
///  discovery.
///
/// This is an abstraction introduced to keep sessions from pointing back to the entity owning
///  them, and to facilitate mocking discovery away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionObserver: Send + Sync + 'static {
    /// called with the current set of session peers after sessions were added or removed. Calls
    ///  are sequential, and several changes in short succession may be reported as one.
    async fn sessions_changed(&self, remote_pks: Vec<PublicKey>) -> anyhow::Result<()>;
}


/// An entity's (client or server) sessions, by remote public key.
///
/// The lock only protects the map. The observer is called from a separate task, so slow or
///  failing discovery updates never block session bookkeeping.
pub struct EntityRegistry {
    sessions: Mutex<FxHashMap<PublicKey, Session>>,
    changed: Arc<Notify>,
    count_tx: watch::Sender<usize>,
}

impl EntityRegistry {
    pub fn new(observer: Arc<dyn SessionObserver>, cancel: CancellationToken) -> Arc<EntityRegistry> {
        let (count_tx, _) = watch::channel(0);
        let result = Arc::new(EntityRegistry {
            sessions: Default::default(),
            changed: Arc::new(Notify::new()),
            count_tx,
        });

        tokio::spawn(Self::notify_loop(Arc::downgrade(&result), result.changed.clone(), observer, cancel)
            .instrument(Span::current()));
        result
    }

    async fn notify_loop(registry: Weak<EntityRegistry>, changed: Arc<Notify>, observer: Arc<dyn SessionObserver>, cancel: CancellationToken) {
        loop {
            select! {
                _ = cancel.cancelled() => break,
                _ = changed.notified() => {}
            }
            let Some(registry) = registry.upgrade() else { break };
            let remote_pks = registry.remote_pks();
            drop(registry);

            trace!(num_sessions = remote_pks.len(), "notifying observer of session change");
            if let Err(e) = observer.sessions_changed(remote_pks).await {
                warn!("failed to publish session change: {}", e);
            }
        }
        trace!("session observer loop terminated");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<PublicKey, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_change(&self, count: usize) {
        self.count_tx.send_replace(count);
        self.changed.notify_one();
    }

    /// Registers a session, replacing and returning an earlier session with the same peer
    pub fn set_session(&self, session: Session) -> Option<Session> {
        let remote_pk = session.remote_pk();
        let (prev, count) = {
            let mut sessions = self.lock();
            let prev = sessions.insert(remote_pk, session);
            (prev, sessions.len())
        };
        debug!(remote = %remote_pk.short(), num_sessions = count, "added session");
        self.on_change(count);
        prev
    }

    /// Removes a session if it is still registered - a newer session with the same peer is left
    ///  alone. Returns `true` if the session was removed.
    pub fn del_session(&self, session: &Session) -> bool {
        let remote_pk = session.remote_pk();
        let count = {
            let mut sessions = self.lock();
            match sessions.get(&remote_pk) {
                Some(s) if s.ptr_eq(session) => {
                    sessions.remove(&remote_pk);
                    sessions.len()
                }
                _ => return false,
            }
        };
        debug!(remote = %remote_pk.short(), num_sessions = count, "removed session");
        self.on_change(count);
        true
    }

    pub fn session(&self, remote_pk: &PublicKey) -> Option<Session> {
        self.lock().get(remote_pk).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.lock().values().cloned().collect()
    }

    pub fn remote_pks(&self) -> Vec<PublicKey> {
        let mut result = self.lock().keys().copied().collect::<Vec<_>>();
        result.sort();
        result
    }

    /// Removes all sessions, e.g. to close them when the entity shuts down
    pub fn take_all(&self) -> Vec<Session> {
        let result = self.lock().drain().map(|(_, s)| s).collect::<Vec<_>>();
        if !result.is_empty() {
            self.on_change(0);
        }
        result
    }

    /// Removes and closes all sessions, returning the first error after trying all of them
    pub fn close_all(&self) -> anyhow::Result<()> {
        let mut result = Ok(());
        for session in self.take_all() {
            if let Err(e) = session.close() {
                warn!(remote = %session.remote_pk().short(), "error closing session: {}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// the number of sessions, updated on every change
    pub fn subscribe_count(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::anyhow;
    use tokio::sync::mpsc;
    use super::*;
    use crate::session::tests::session_pair;
    use crate::test_util::keys::test_pk;

    /// an observer reporting every call on a channel
    fn channel_observer(fail: bool) -> (Arc<MockSessionObserver>, mpsc::UnboundedReceiver<Vec<PublicKey>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut observer = MockSessionObserver::new();
        observer.expect_sessions_changed()
            .returning(move |pks| {
                let _ = tx.send(pks);
                if fail { Err(anyhow!("discovery is down")) } else { Ok(()) }
            });
        (Arc::new(observer), rx)
    }

    async fn next_change(rx: &mut mpsc::UnboundedReceiver<Vec<PublicKey>>) -> Vec<PublicKey> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_set_and_del() {
        let (observer, mut changes) = channel_observer(false);
        let registry = EntityRegistry::new(observer, CancellationToken::new());

        let (to_server, _server) = session_pair(1, 2).await;
        assert!(registry.set_session(to_server.clone()).is_none());
        assert_eq!(registry.session_count(), 1);
        assert!(registry.session(&test_pk(2)).unwrap().ptr_eq(&to_server));
        assert_eq!(next_change(&mut changes).await, vec![test_pk(2)]);

        assert!(registry.del_session(&to_server));
        assert!(!registry.del_session(&to_server));
        assert_eq!(registry.session_count(), 0);
        assert_eq!(next_change(&mut changes).await, vec![]);
    }

    #[tokio::test]
    async fn test_del_keeps_newer_session() {
        let (observer, _changes) = channel_observer(false);
        let registry = EntityRegistry::new(observer, CancellationToken::new());

        let (old, _s1) = session_pair(1, 2).await;
        let (new, _s2) = session_pair(1, 2).await;
        registry.set_session(old.clone());
        let replaced = registry.set_session(new.clone()).unwrap();
        assert!(replaced.ptr_eq(&old));

        assert!(!registry.del_session(&old));
        assert!(registry.session(&test_pk(2)).unwrap().ptr_eq(&new));
    }

    #[tokio::test]
    async fn test_observer_failure_does_not_roll_back() {
        let (observer, mut changes) = channel_observer(true);
        let registry = EntityRegistry::new(observer, CancellationToken::new());

        let (session, _server) = session_pair(1, 2).await;
        registry.set_session(session);
        assert_eq!(next_change(&mut changes).await, vec![test_pk(2)]);
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn test_count_subscription() {
        let (observer, _changes) = channel_observer(false);
        let registry = EntityRegistry::new(observer, CancellationToken::new());
        let mut count = registry.subscribe_count();

        let (session, _server) = session_pair(1, 2).await;
        registry.set_session(session);
        count.wait_for(|n| *n == 1).await.unwrap();

        let all = registry.take_all();
        assert_eq!(all.len(), 1);
        count.wait_for(|n| *n == 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_all() {
        let (observer, _changes) = channel_observer(false);
        let registry = EntityRegistry::new(observer, CancellationToken::new());

        let (s1, _server1) = session_pair(1, 2).await;
        let (s2, _server2) = session_pair(1, 3).await;
        registry.set_session(s1.clone());
        registry.set_session(s2.clone());

        registry.close_all().unwrap();
        assert_eq!(registry.session_count(), 0);
        assert!(s1.is_closed());
        assert!(s2.is_closed());
    }

    #[tokio::test]
    async fn test_cancel_stops_notifications() {
        let mut observer = MockSessionObserver::new();
        observer.expect_sessions_changed().never();
        let cancel = CancellationToken::new();
        let registry = EntityRegistry::new(Arc::new(observer), cancel.clone());

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (session, _server) = session_pair(1, 2).await;
        registry.set_session(session);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
