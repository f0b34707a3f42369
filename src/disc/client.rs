use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::cipher::{PublicKey, SecretKey};
use crate::dial::now_nanos;
use crate::disc::entry::Entry;

/// Access to the discovery service. Lookups of unknown keys fail with
///  [crate::error::DmsgError::DiscEntryNotFound], which callers treat as 'create a new entry'.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DiscoveryClient: Send + Sync + 'static {
    async fn entry(&self, pk: PublicKey) -> anyhow::Result<Entry>;

    /// publishes a signed entry
    async fn set_entry(&self, entry: Entry) -> anyhow::Result<()>;

    /// servers that accept more sessions
    async fn available_servers(&self) -> anyhow::Result<Vec<Entry>>;

    /// Publishes a modified entry as the next version: increments its sequence number, refreshes
    ///  its timestamp and signs it
    async fn update_entry(&self, sk: &SecretKey, entry: Entry) -> anyhow::Result<Entry> {
        let mut entry = entry;
        entry.sequence += 1;
        entry.timestamp = now_nanos();
        entry.sign(sk);
        self.set_entry(entry.clone()).await?;
        Ok(entry)
    }
}
