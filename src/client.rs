use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::addr::Addr;
use crate::cipher::{PublicKey, SecretKey};
use crate::config::ClientConfig;
use crate::dial::{TimestampSource, TimestampTracker};
use crate::disc::{ClientInfo, DiscoveryClient, Entry};
use crate::entity::{EntityRegistry, SessionObserver};
use crate::error::DmsgError;
use crate::listener::{close_listener, Listener, PortValue};
use crate::porter::Porter;
use crate::session::Session;
use crate::stream::{self, Stream};
use crate::util::backoff::ExponentialBackoff;


/// A dmsg client: holds sessions to relay servers, is reachable through them, and dials streams
///  to other clients through their relay servers.
///
/// This is a handle - clones refer to the same client. The client does nothing by itself until
///  [Client::serve] runs, which maintains the sessions.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    pk: PublicKey,
    sk: SecretKey,
    disc: Arc<dyn DiscoveryClient>,
    config: Arc<ClientConfig>,
    registry: Arc<EntityRegistry>,
    porter: Porter<PortValue>,
    timestamps: TimestampSource,
    tracker: TimestampTracker,
    cancel: CancellationToken,
    closed: AtomicBool,
    session_ended: Notify,
    /// one lock per server that is being dialed, so that concurrent callers share a single session
    dialing: Mutex<FxHashMap<PublicKey, Arc<tokio::sync::Mutex<()>>>>,
    span: Span,
}

impl Client {
    pub fn new(sk: SecretKey, disc: Arc<dyn DiscoveryClient>, config: Arc<ClientConfig>) -> anyhow::Result<Client> {
        config.validate()?;

        let pk = sk.public_key();
        let span = info_span!("dmsg_client", pk = %pk.short());
        let cancel = CancellationToken::new();

        let registry = {
            let _entered = span.enter();
            let updater = ClientEntryUpdater {
                pk,
                sk: sk.clone(),
                disc: disc.clone(),
            };
            EntityRegistry::new(Arc::new(updater), cancel.clone())
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                pk,
                sk,
                disc,
                config,
                registry,
                porter: Porter::new(),
                timestamps: Default::default(),
                tracker: Default::default(),
                cancel,
                closed: AtomicBool::new(false),
                session_ended: Notify::new(),
                dialing: Default::default(),
                span,
            }),
        })
    }

    pub fn pk(&self) -> PublicKey {
        self.inner.pk
    }

    /// Maintains sessions to at least `min_sessions` relay servers, dialing servers that discovery
    ///  reports as available, and reconnecting with exponential backoff after failures or lost
    ///  sessions. Runs until the client is closed or `cancel` is cancelled.
    pub async fn serve(&self, cancel: CancellationToken) {
        let inner = self.inner.clone();
        async move {
            info!("serving");
            let mut backoff = ExponentialBackoff::new(inner.config.reconnect_interval, inner.config.max_reconnect_interval);

            loop {
                if inner.registry.session_count() >= inner.config.min_sessions {
                    select! {
                        _ = cancel.cancelled() => break,
                        _ = inner.cancel.cancelled() => break,
                        _ = inner.session_ended.notified() => continue,
                    }
                }

                let result = select! {
                    _ = cancel.cancelled() => break,
                    _ = inner.cancel.cancelled() => break,
                    result = Self::connect_to_available_server(&inner) => result,
                };
                match result {
                    Ok(()) => backoff.reset(),
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!("failed to establish session, retrying in {:?}: {}", delay, e);
                        select! {
                            _ = cancel.cancelled() => break,
                            _ = inner.cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
            info!("stopped serving");
        }.instrument(self.inner.span.clone()).await
    }

    async fn connect_to_available_server(inner: &Arc<ClientInner>) -> anyhow::Result<()> {
        let servers = inner.disc.available_servers().await?;
        if servers.is_empty() {
            bail!("discovery has no available servers");
        }

        for entry in servers {
            if inner.registry.session(&entry.pk).is_some() {
                continue;
            }
            let Some(server) = &entry.server else { continue };

            match Self::ensure_session(inner, entry.pk, &server.address).await {
                Ok(_) => return Ok(()),
                Err(e) => debug!(server = %entry.pk.short(), "failed to establish session: {}", e),
            }
        }
        Err(anyhow!("no available server could be reached"))
    }

    /// The session to a server, dialing it if there is none yet. Concurrent calls for the same
    ///  server wait for a single dial: the server keeps only one session per client, so a second
    ///  session would replace the first one.
    async fn ensure_session(inner: &Arc<ClientInner>, server_pk: PublicKey, address: &str) -> anyhow::Result<Session> {
        if let Some(session) = inner.registry.session(&server_pk) {
            return Ok(session);
        }

        let dial_lock = inner.lock_dialing().entry(server_pk).or_default().clone();
        let result = {
            let _guard = dial_lock.lock().await;
            match inner.registry.session(&server_pk) {
                Some(session) if !session.is_closed() => Ok(session),
                _ => Self::dial_session(inner, server_pk, address).await,
            }
        };

        let mut dialing = inner.lock_dialing();
        // the map and this call hold the only references when nobody else is waiting
        if Arc::strong_count(&dial_lock) <= 2 {
            dialing.remove(&server_pk);
        }
        result
    }

    async fn dial_session(inner: &Arc<ClientInner>, server_pk: PublicKey, address: &str) -> anyhow::Result<Session> {
        let session = Session::dial(&inner.sk, server_pk, address, inner.config.handshake_timeout, inner.config.mux.clone()).await?;
        if let Some(prev) = inner.registry.set_session(session.clone()) {
            let _ = prev.close();
        }
        // closing the client takes all sessions from the registry - a session that was
        //  registered concurrently must not survive it
        if inner.cancel.is_cancelled() {
            inner.registry.del_session(&session);
            let _ = session.close();
            return Err(DmsgError::EntityClosed.into());
        }

        let span = info_span!("session", server = %server_pk.short());
        tokio::spawn(Self::serve_session(inner.clone(), session.clone()).instrument(span));
        Ok(session)
    }

    /// accepts dial requests that the server relays to this client
    async fn serve_session(inner: Arc<ClientInner>, session: Session) {
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
                if let Err(e) = stream::respond(sub, &session, &inner.sk, &inner.porter, &inner.tracker, inner.config.handshake_timeout).await {
                    debug!("failed to accept stream: {}", e);
                }
            }.instrument(Span::current()));
        }

        let _ = session.close();
        inner.registry.del_session(&session);
        inner.session_ended.notify_one();
    }

    /// Resolves once the client holds `min_sessions` sessions
    pub async fn ready(&self) -> anyhow::Result<()> {
        let mut count = self.inner.registry.subscribe_count();
        let min_sessions = self.inner.config.min_sessions;
        select! {
            _ = self.inner.cancel.cancelled() => Err(DmsgError::EntityClosed.into()),
            result = count.wait_for(|n| *n >= min_sessions) => {
                result.map_err(|_| DmsgError::EntityClosed)?;
                Ok(())
            }
        }
    }

    /// Starts accepting streams on a port. Fails if the port is taken by another listener or a
    ///  dialed stream.
    pub fn listen(&self, port: u16) -> anyhow::Result<Listener> {
        if self.is_closed() {
            return Err(DmsgError::EntityClosed.into());
        }
        if port == 0 {
            bail!("can not listen on port 0");
        }
        let _entered = self.inner.span.enter();
        Listener::bind(&self.inner.porter, Addr::new(self.inner.pk, port), self.inner.config.accept_buffer_size)
    }

    /// Opens a stream to a listening client, through one of the servers the client is reachable
    ///  by. Servers this client already holds a session to are preferred.
    pub async fn dial_stream(&self, addr: Addr) -> anyhow::Result<Stream> {
        let inner = &self.inner;
        async move {
            if self.is_closed() {
                return Err(DmsgError::EntityClosed.into());
            }

            let entry = inner.disc.entry(addr.pk).await?;
            let servers = entry.delegated_servers();
            if servers.is_empty() {
                return Err(DmsgError::NoDelegatedServers.into());
            }

            for server_pk in servers {
                if let Some(session) = inner.registry.session(server_pk) {
                    return self.dial_via(&session, addr).await;
                }
            }

            for server_pk in servers {
                let server_entry = match inner.disc.entry(*server_pk).await {
                    Ok(e) => e,
                    Err(e) => {
                        debug!(server = %server_pk.short(), "no discovery entry for delegated server: {}", e);
                        continue;
                    }
                };
                let Some(server) = &server_entry.server else { continue };

                match Self::ensure_session(inner, *server_pk, &server.address).await {
                    Ok(session) => return self.dial_via(&session, addr).await,
                    Err(e) => debug!(server = %server_pk.short(), "failed to establish session: {}", e),
                }
            }
            Err(DmsgError::CannotConnectToDelegated.into())
        }.instrument(self.inner.span.clone()).await
    }

    async fn dial_via(&self, session: &Session, addr: Addr) -> anyhow::Result<Stream> {
        let inner = &self.inner;
        stream::dial(session, &inner.sk, &inner.porter, &inner.timestamps, addr, inner.config.handshake_timeout).await
    }

    pub fn session_count(&self) -> usize {
        self.inner.registry.session_count()
    }

    /// public keys of the servers this client holds sessions to
    pub fn servers(&self) -> Vec<PublicKey> {
        self.inner.registry.remote_pks()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes all sessions and listeners, and stops [Client::serve]. Idempotent and safe to call
    ///  concurrently: only the first call does the work, and it returns the first error of closing
    ///  a session after closing everything else anyway.
    pub fn close(&self) -> anyhow::Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _entered = self.inner.span.enter();
        info!("closing");

        self.inner.cancel.cancel();
        let result = self.inner.registry.close_all();
        for (_, value) in self.inner.porter.all() {
            close_listener(&value);
        }
        result
    }
}


impl ClientInner {
    fn lock_dialing(&self) -> std::sync::MutexGuard<'_, FxHashMap<PublicKey, Arc<tokio::sync::Mutex<()>>>> {
        self.dialing.lock().unwrap_or_else(|e| e.into_inner())
    }
}


/// Publishes the servers a client holds sessions to as its 'delegated servers'
struct ClientEntryUpdater {
    pk: PublicKey,
    sk: SecretKey,
    disc: Arc<dyn DiscoveryClient>,
}

#[async_trait]
impl SessionObserver for ClientEntryUpdater {
    async fn sessions_changed(&self, remote_pks: Vec<PublicKey>) -> anyhow::Result<()> {
        match self.disc.entry(self.pk).await {
            Ok(mut entry) => {
                entry.client = Some(ClientInfo { delegated_servers: remote_pks });
                self.disc.update_entry(&self.sk, entry).await?;
            }
            Err(e) if DmsgError::is(&e, &DmsgError::DiscEntryNotFound) => {
                let mut entry = Entry::new_client(self.pk, remote_pks);
                entry.sign(&self.sk);
                self.disc.set_entry(entry).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockall::predicate::eq;
    use super::*;
    use crate::disc::client::MockDiscoveryClient;
    use crate::config::ServerConfig;
    use crate::disc::InMemoryDiscovery;
    use crate::server::Server;
    use crate::test_util::keys::{test_key_pair, test_pk};

    fn client_with(disc: Arc<dyn DiscoveryClient>) -> Client {
        Client::new(test_key_pair(1).1, disc, Arc::new(ClientConfig::default())).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let config = ClientConfig {
            min_sessions: 0,
            ..ClientConfig::default()
        };
        assert!(Client::new(test_key_pair(1).1, Arc::new(InMemoryDiscovery::new()), Arc::new(config)).is_err());
    }

    #[tokio::test]
    async fn test_listen() {
        let client = client_with(Arc::new(InMemoryDiscovery::new()));

        let listener = client.listen(80).unwrap();
        assert_eq!(listener.addr(), Addr::new(test_pk(1), 80));

        let err = client.listen(80).err().unwrap();
        assert_eq!(DmsgError::of(&err), Some(&DmsgError::PortOccupied(80)));
        assert!(!listener.is_closed());

        assert!(client.listen(0).is_err());
    }

    #[tokio::test]
    async fn test_close() {
        let client = client_with(Arc::new(InMemoryDiscovery::new()));
        let listener = client.listen(80).unwrap();

        let handles = (0..8)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.close() })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert!(client.is_closed());
        client.close().unwrap();
        assert!(listener.is_closed());
        assert!(DmsgError::is(&client.listen(81).err().unwrap(), &DmsgError::EntityClosed));
        assert!(DmsgError::is(&client.dial_stream(Addr::new(test_pk(2), 80)).await.err().unwrap(), &DmsgError::EntityClosed));
        assert!(DmsgError::is(&client.ready().await.err().unwrap(), &DmsgError::EntityClosed));

        // returns right away
        tokio::time::timeout(Duration::from_secs(1), client.serve(CancellationToken::new())).await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_without_delegated_servers() {
        let mut disc = MockDiscoveryClient::new();
        disc.expect_entry()
            .with(eq(test_pk(2)))
            .returning(|pk| Ok(Entry::new_client(pk, vec![])));
        let client = client_with(Arc::new(disc));

        let err = client.dial_stream(Addr::new(test_pk(2), 80)).await.err().unwrap();
        assert_eq!(DmsgError::of(&err), Some(&DmsgError::NoDelegatedServers));
    }

    #[tokio::test]
    async fn test_dial_unknown_client() {
        let mut disc = MockDiscoveryClient::new();
        disc.expect_entry()
            .returning(|_| Err(DmsgError::DiscEntryNotFound.into()));
        let client = client_with(Arc::new(disc));

        let err = client.dial_stream(Addr::new(test_pk(2), 80)).await.err().unwrap();
        assert_eq!(DmsgError::of(&err), Some(&DmsgError::DiscEntryNotFound));
    }

    #[tokio::test]
    async fn test_dial_unreachable_delegated_server() {
        // a port that nobody listens on
        let address = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let mut disc = MockDiscoveryClient::new();
        disc.expect_entry()
            .with(eq(test_pk(2)))
            .returning(|pk| Ok(Entry::new_client(pk, vec![test_pk(8), test_pk(9)])));
        disc.expect_entry()
            .with(eq(test_pk(8)))
            .returning(|_| Err(DmsgError::DiscEntryNotFound.into()));
        disc.expect_entry()
            .with(eq(test_pk(9)))
            .returning(move |pk| Ok(Entry::new_server(pk, address.clone(), 10)));
        let client = client_with(Arc::new(disc));

        let err = client.dial_stream(Addr::new(test_pk(2), 80)).await.err().unwrap();
        assert_eq!(DmsgError::of(&err), Some(&DmsgError::CannotConnectToDelegated));
        assert_eq!(client.session_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_dials_share_one_session() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let disc = Arc::new(InMemoryDiscovery::new());
        let server = Server::new(test_key_pair(9).1, disc.clone(), Arc::new(ServerConfig::new(address.clone()))).unwrap();
        tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener, CancellationToken::new()).await }
        });

        let client = client_with(disc);
        let dials = (0..4)
            .map(|_| {
                let inner = client.inner.clone();
                let address = address.clone();
                tokio::spawn(async move { Client::ensure_session(&inner, test_pk(9), &address).await })
            })
            .collect::<Vec<_>>();
        let mut sessions = Vec::new();
        for d in dials {
            sessions.push(d.await.unwrap().unwrap());
        }

        assert!(sessions.iter().all(|s| s.ptr_eq(&sessions[0])));
        assert_eq!(client.session_count(), 1);

        // a second session would have made the server drop the first one
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sessions[0].is_closed());
        assert_eq!(server.session_count(), 1);

        client.close().unwrap();
        server.close().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_backs_off_without_servers() {
        let mut disc = MockDiscoveryClient::new();
        disc.expect_available_servers()
            .times(3)
            .returning(|| Ok(vec![]));
        let client = client_with(Arc::new(disc));

        // 3s + 6s between the three attempts
        let cancel = CancellationToken::new();
        let serving = tokio::spawn({
            let client = client.clone();
            let cancel = cancel.clone();
            async move { client.serve(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(9500)).await;
        cancel.cancel();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn test_entry_updater_creates_entry() {
        let (pk, sk) = test_key_pair(1);
        let mut disc = MockDiscoveryClient::new();
        disc.expect_entry()
            .with(eq(pk))
            .returning(|_| Err(DmsgError::DiscEntryNotFound.into()));
        disc.expect_set_entry()
            .withf(move |e| e.pk == pk && e.delegated_servers() == [test_pk(5)] && e.verify().is_ok())
            .times(1)
            .returning(|_| Ok(()));

        let updater = ClientEntryUpdater { pk, sk, disc: Arc::new(disc) };
        updater.sessions_changed(vec![test_pk(5)]).await.unwrap();
    }

    #[tokio::test]
    async fn test_entry_updater_updates_entry() {
        let disc = Arc::new(InMemoryDiscovery::new());
        let (pk, sk) = test_key_pair(1);
        let updater = ClientEntryUpdater { pk, sk, disc: disc.clone() };

        updater.sessions_changed(vec![test_pk(5)]).await.unwrap();
        updater.sessions_changed(vec![test_pk(5), test_pk(6)]).await.unwrap();
        let entry = disc.entry(pk).await.unwrap();
        assert_eq!(entry.sequence, 1);
        assert_eq!(entry.delegated_servers(), &[test_pk(5), test_pk(6)]);

        updater.sessions_changed(vec![]).await.unwrap();
        assert!(disc.entry(pk).await.unwrap().delegated_servers().is_empty());
    }

    #[tokio::test]
    async fn test_entry_updater_propagates_discovery_errors() {
        let mut disc = MockDiscoveryClient::new();
        disc.expect_entry()
            .returning(|_| Err(anyhow!("connection refused")));
        disc.expect_set_entry().never();

        let (pk, sk) = test_key_pair(1);
        let updater = ClientEntryUpdater { pk, sk, disc: Arc::new(disc) };
        assert!(updater.sessions_changed(vec![test_pk(5)]).await.is_err());
    }
}
