//! Consumed interface of the discovery service, a directory mapping public keys to signed entries:
//!  servers publish their network address and spare capacity, clients the servers they can be
//!  reached through.

pub mod client;
pub mod entry;
pub mod in_memory;

pub use client::DiscoveryClient;
pub use entry::{ClientInfo, Entry, ServerInfo};
pub use in_memory::InMemoryDiscovery;
