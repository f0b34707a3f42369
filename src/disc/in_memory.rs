use std::sync::Mutex;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::cipher::PublicKey;
use crate::disc::client::DiscoveryClient;
use crate::disc::entry::Entry;
use crate::error::DmsgError;

/// Discovery held in memory, for tests and for embedding a complete network in one process. It
///  enforces what a discovery server does: entries must be signed by their key, and updates must
///  carry a higher sequence number than the stored entry.
#[derive(Default)]
pub struct InMemoryDiscovery {
    entries: Mutex<FxHashMap<PublicKey, Entry>>,
}

impl InMemoryDiscovery {
    pub fn new() -> InMemoryDiscovery {
        Default::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<PublicKey, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DiscoveryClient for InMemoryDiscovery {
    async fn entry(&self, pk: PublicKey) -> anyhow::Result<Entry> {
        self.lock().get(&pk)
            .cloned()
            .ok_or_else(|| DmsgError::DiscEntryNotFound.into())
    }

    async fn set_entry(&self, entry: Entry) -> anyhow::Result<()> {
        if let Err(e) = entry.verify() {
            return Err(DmsgError::DiscEntryInvalid(e.to_string()).into());
        }

        let mut entries = self.lock();
        if let Some(prev) = entries.get(&entry.pk) {
            if entry.sequence <= prev.sequence {
                return Err(DmsgError::DiscEntryInvalid(format!("sequence {} is not greater than {}", entry.sequence, prev.sequence)).into());
            }
        }
        trace!(pk = %entry.pk.short(), sequence = entry.sequence, "storing entry");
        entries.insert(entry.pk, entry);
        Ok(())
    }

    async fn available_servers(&self) -> anyhow::Result<Vec<Entry>> {
        let mut result = self.lock().values()
            .filter(|e| matches!(&e.server, Some(s) if s.available_sessions > 0))
            .cloned()
            .collect::<Vec<_>>();
        result.sort_by_key(|e| e.pk);
        Ok(result)
    }
}
