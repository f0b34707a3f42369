//! The relay server: accepts sessions from clients and forwards streams between two clients that
//!  both hold a session to it.

mod relay;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::select;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::cipher::{PublicKey, SecretKey};
use crate::config::ServerConfig;
use crate::dial::TimestampTracker;
use crate::disc::{DiscoveryClient, Entry, ServerInfo};
use crate::entity::{EntityRegistry, SessionObserver};
use crate::error::{is_temporary_io, DmsgError};
use crate::session::Session;


/// This is a handle - clones refer to the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    pk: PublicKey,
    sk: SecretKey,
    config: Arc<ServerConfig>,
    registry: Arc<EntityRegistry>,
    updater: Arc<ServerEntryUpdater>,
    tracker: TimestampTracker,
    cancel: CancellationToken,
    closed: AtomicBool,
    span: Span,
}

impl Server {
    pub fn new(sk: SecretKey, disc: Arc<dyn DiscoveryClient>, config: Arc<ServerConfig>) -> anyhow::Result<Server> {
        config.validate()?;

        let pk = sk.public_key();
        let span = info_span!("dmsg_server", pk = %pk.short());
        let cancel = CancellationToken::new();

        let updater = Arc::new(ServerEntryUpdater {
            pk,
            sk: sk.clone(),
            disc,
            address: config.public_address.clone(),
            max_sessions: config.max_sessions,
        });
        let registry = {
            let _entered = span.enter();
            EntityRegistry::new(updater.clone(), cancel.clone())
        };

        Ok(Server {
            inner: Arc::new(ServerInner {
                pk,
                sk,
                config,
                registry,
                updater,
                tracker: Default::default(),
                cancel,
                closed: AtomicBool::new(false),
                span,
            }),
        })
    }

    pub fn pk(&self) -> PublicKey {
        self.inner.pk
    }

    /// Publishes the server's discovery entry and accepts sessions on `listener`, until the server
    ///  is closed or `cancel` is cancelled.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
        let inner = self.inner.clone();
        async move {
            info!(addr = ?listener.local_addr().ok(), public_address = %inner.config.public_address, "serving");

            if let Err(e) = inner.updater.publish(0).await {
                warn!("failed to publish discovery entry: {}", e);
            }
            tokio::spawn(Self::update_loop(inner.clone(), cancel.clone()).instrument(Span::current()));

            loop {
                let accepted = select! {
                    _ = cancel.cancelled() => break,
                    _ = inner.cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((tcp, peer_addr)) => {
                        let span = info_span!("session", peer = %peer_addr);
                        tokio::spawn(Self::handle_connection(inner.clone(), tcp, peer_addr).instrument(span));
                    }
                    Err(e) if is_temporary_io(&e) => {
                        warn!("temporary error accepting connection: {}", e);
                    }
                    Err(e) => {
                        warn!("error accepting connection, stopping: {}", e);
                        return Err(e.into());
                    }
                }
            }
            info!("stopped serving");
            Ok(())
        }.instrument(self.inner.span.clone()).await
    }

    /// re-publishes the entry periodically so that discovery does not expire it
    async fn update_loop(inner: Arc<ServerInner>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(inner.config.update_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            select! {
                _ = cancel.cancelled() => break,
                _ = inner.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = inner.updater.publish(inner.registry.session_count()).await {
                warn!("failed to re-publish discovery entry: {}", e);
            }
        }
    }

    async fn handle_connection(inner: Arc<ServerInner>, tcp: tokio::net::TcpStream, peer_addr: std::net::SocketAddr) {
        if inner.registry.session_count() >= inner.config.max_sessions {
            debug!("{}, refusing connection", DmsgError::SessionLimitReached);
            return;
        }
        let _ = tcp.set_nodelay(true);

        let session = match Session::respond(tcp, Some(peer_addr), &inner.sk, inner.config.handshake_timeout, inner.config.mux.clone()).await {
            Ok(session) => session,
            Err(e) => {
                debug!("session handshake failed: {}", e);
                return;
            }
        };
        if let Some(prev) = inner.registry.set_session(session.clone()) {
            debug!(client = %session.remote_pk().short(), "replacing previous session");
            let _ = prev.close();
        }
        if inner.cancel.is_cancelled() {
            inner.registry.del_session(&session);
            let _ = session.close();
            return;
        }

        let span = info_span!("client", client = %session.remote_pk().short());
        Self::serve_session(inner, session).instrument(span).await;
    }

    /// relays the streams the client dials through this session
    async fn serve_session(inner: Arc<ServerInner>, session: Session) {
        loop {
            let sub = select! {
                _ = inner.cancel.cancelled() => break,
                sub = session.accept_sub_stream() => sub,
            };
            let sub = match sub {
                Ok(sub) => sub,
                Err(e) => {
                    debug!("session ended: {}", e);
                    break;
                }
            };

            let inner = inner.clone();
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(e) = relay::proxy_stream(&inner, &session, sub).await {
                    debug!("relaying stream failed: {}", e);
                }
            }.instrument(Span::current()));
        }

        let _ = session.close();
        inner.registry.del_session(&session);
    }

    pub fn session_count(&self) -> usize {
        self.inner.registry.session_count()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes all sessions and stops [Server::serve]. Idempotent and safe to call concurrently:
    ///  later calls return `Ok` right away, the first one returns the first error of closing a
    ///  session.
    pub fn close(&self) -> anyhow::Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _entered = self.inner.span.enter();
        info!("closing");

        self.inner.cancel.cancel();
        self.inner.registry.close_all()
    }
}


/// Publishes the server's address and remaining capacity
struct ServerEntryUpdater {
    pk: PublicKey,
    sk: SecretKey,
    disc: Arc<dyn DiscoveryClient>,
    address: String,
    max_sessions: usize,
}

impl ServerEntryUpdater {
    async fn publish(&self, num_sessions: usize) -> anyhow::Result<()> {
        let server_info = ServerInfo {
            address: self.address.clone(),
            available_sessions: u32::try_from(self.max_sessions.saturating_sub(num_sessions)).unwrap_or(u32::MAX),
        };

        match self.disc.entry(self.pk).await {
            Ok(mut entry) => {
                entry.server = Some(server_info);
                self.disc.update_entry(&self.sk, entry).await?;
            }
            Err(e) if DmsgError::is(&e, &DmsgError::DiscEntryNotFound) => {
                let mut entry = Entry::new_server(self.pk, server_info.address, server_info.available_sessions);
                entry.sign(&self.sk);
                self.disc.set_entry(entry).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

#[async_trait]
impl SessionObserver for ServerEntryUpdater {
    async fn sessions_changed(&self, remote_pks: Vec<PublicKey>) -> anyhow::Result<()> {
        self.publish(remote_pks.len()).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::MuxConfig;
    use crate::disc::InMemoryDiscovery;
    use crate::test_util::keys::{test_key_pair, test_pk};

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn start_server(disc: Arc<InMemoryDiscovery>, max_sessions: usize) -> (Server, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let config = ServerConfig {
            max_sessions,
            ..ServerConfig::new(address.clone())
        };
        let server = Server::new(test_key_pair(9).1, disc, Arc::new(config)).unwrap();

        let s = server.clone();
        tokio::spawn(async move { s.serve(listener, CancellationToken::new()).await });
        (server, address)
    }

    async fn wait_for_available(disc: &InMemoryDiscovery, expected: u32) {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                if let Ok(entry) = disc.entry(test_pk(9)).await {
                    if entry.server.map(|s| s.available_sessions) == Some(expected) {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_publishes_entry() {
        let disc = Arc::new(InMemoryDiscovery::new());
        let (_server, address) = start_server(disc.clone(), 10).await;

        wait_for_available(&disc, 10).await;
        let entry = disc.entry(test_pk(9)).await.unwrap();
        assert_eq!(entry.server.unwrap().address, address);
    }

    #[tokio::test]
    async fn test_sessions_update_entry() {
        let disc = Arc::new(InMemoryDiscovery::new());
        let (server, address) = start_server(disc.clone(), 10).await;

        let session = Session::dial(&test_key_pair(1).1, test_pk(9), &address, TIMEOUT, MuxConfig::default()).await.unwrap();
        wait_for_available(&disc, 9).await;
        assert_eq!(server.session_count(), 1);

        session.close().unwrap();
        wait_for_available(&disc, 10).await;
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_refuses_sessions_beyond_max() {
        let disc = Arc::new(InMemoryDiscovery::new());
        let (server, address) = start_server(disc.clone(), 1).await;

        let _s1 = Session::dial(&test_key_pair(1).1, test_pk(9), &address, TIMEOUT, MuxConfig::default()).await.unwrap();
        wait_for_available(&disc, 0).await;

        let s2 = Session::dial(&test_key_pair(2).1, test_pk(9), &address, TIMEOUT, MuxConfig::default()).await;
        assert!(s2.is_err());
        assert_eq!(server.session_count(), 1);
    }

    #[tokio::test]
    async fn test_close() {
        let disc = Arc::new(InMemoryDiscovery::new());
        let (server, address) = start_server(disc.clone(), 10).await;
        let session = Session::dial(&test_key_pair(1).1, test_pk(9), &address, TIMEOUT, MuxConfig::default()).await.unwrap();
        wait_for_available(&disc, 9).await;

        server.close().unwrap();
        server.close().unwrap();
        assert!(server.is_closed());
        assert_eq!(server.session_count(), 0);
        tokio::time::timeout(TIMEOUT, session.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_caps_available_sessions() {
        let disc = Arc::new(InMemoryDiscovery::new());
        let updater = ServerEntryUpdater {
            pk: test_pk(9),
            sk: test_key_pair(9).1,
            disc: disc.clone(),
            address: "127.0.0.1:1".to_string(),
            max_sessions: u32::MAX as usize + 10,
        };

        updater.publish(1).await.unwrap();
        assert_eq!(disc.entry(test_pk(9)).await.unwrap().server.unwrap().available_sessions, u32::MAX);
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let config = ServerConfig::new("");
        assert!(Server::new(test_key_pair(9).1, Arc::new(InMemoryDiscovery::new()), Arc::new(config)).is_err());
    }
}
