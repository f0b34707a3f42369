use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::config::EPHEMERAL_PORTS;
use crate::error::DmsgError;


/// A client's table of logical ports, mapping each occupied port to an opaque value (e.g. the
///  listener bound to it, or a marker for a dialed stream's ephemeral port).
pub struct Porter<V> {
    inner: Arc<Mutex<PorterInner<V>>>,
    ephemeral: RangeInclusive<u16>,
}

struct PorterInner<V> {
    ports: FxHashMap<u16, V>,
    next_ephemeral: u16,
}

impl <V: Clone + Send + 'static> Porter<V> {
    pub fn new() -> Porter<V> {
        Self::with_ephemeral_range(EPHEMERAL_PORTS)
    }

    pub fn with_ephemeral_range(ephemeral: RangeInclusive<u16>) -> Porter<V> {
        Porter {
            inner: Arc::new(Mutex::new(PorterInner {
                ports: Default::default(),
                next_ephemeral: *ephemeral.start(),
            })),
            ephemeral,
        }
    }

    fn lock(inner: &Mutex<PorterInner<V>>) -> std::sync::MutexGuard<'_, PorterInner<V>> {
        inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn reserve(&self, port: u16, value: V) -> Result<PortGuard, DmsgError> {
        let mut inner = Self::lock(&self.inner);
        if inner.ports.contains_key(&port) {
            return Err(DmsgError::PortOccupied(port));
        }
        inner.ports.insert(port, value);
        trace!(port, "reserved port");
        Ok(self.guard(port))
    }

    /// Picks a free port from the ephemeral range, round robin so that recently released ports are
    ///  not reused right away
    pub fn reserve_ephemeral(&self, value: V) -> Result<(u16, PortGuard), DmsgError> {
        let mut inner = Self::lock(&self.inner);

        let range_len = (*self.ephemeral.end() - *self.ephemeral.start()) as usize + 1;
        for _ in 0..range_len {
            let candidate = inner.next_ephemeral;
            inner.next_ephemeral = if candidate >= *self.ephemeral.end() {
                *self.ephemeral.start()
            }
            else {
                candidate + 1
            };

            if !inner.ports.contains_key(&candidate) {
                inner.ports.insert(candidate, value);
                trace!(port = candidate, "reserved ephemeral port");
                return Ok((candidate, self.guard(candidate)));
            }
        }
        Err(DmsgError::NoEphemeralPort)
    }

    fn guard(&self, port: u16) -> PortGuard {
        let inner = Arc::downgrade(&self.inner);
        PortGuard::new(port, move || {
            if let Some(inner) = inner.upgrade() {
                Self::lock(&inner).ports.remove(&port);
                trace!(port, "released port");
            }
        })
    }

    pub fn lookup(&self, port: u16) -> Option<V> {
        Self::lock(&self.inner).ports.get(&port).cloned()
    }

    pub fn is_occupied(&self, port: u16) -> bool {
        Self::lock(&self.inner).ports.contains_key(&port)
    }

    /// Snapshot of all occupied ports and their values
    pub fn all(&self) -> Vec<(u16, V)> {
        Self::lock(&self.inner).ports.iter()
            .map(|(port, value)| (*port, value.clone()))
            .collect()
    }
}

impl <V: Clone + Send + 'static> Default for Porter<V> {
    fn default() -> Self {
        Self::new()
    }
}


/// Releases a reserved port when it is released explicitly or dropped, whichever comes first
pub struct PortGuard {
    port: u16,
    release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl PortGuard {
    fn new(port: u16, release: impl FnOnce() + Send + 'static) -> PortGuard {
        PortGuard {
            port,
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// idempotent
    pub fn release(&self) {
        let release = self.release.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(release) = release {
            release();
        }
    }
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        self.release();
    }
}
