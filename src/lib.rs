//! An encrypted overlay network: clients hold encrypted, multiplexed sessions to relay servers,
//!  and reach each other through streams that a server relays between two of its sessions
//!  without being able to read them.

pub mod addr;
pub mod cipher;
pub mod client;
pub mod config;
pub mod dial;
pub mod disc;
pub mod entity;
pub mod error;
pub mod listener;
pub mod mux;
pub mod noise;
pub mod porter;
pub mod server;
pub mod session;
pub mod stream;
pub mod util;
pub mod test_util;

pub use addr::Addr;
pub use cipher::{gen_key_pair, PublicKey, SecretKey};
pub use client::Client;
pub use config::{ClientConfig, MuxConfig, ServerConfig};
pub use error::{DmsgError, ErrorCategory};
pub use listener::Listener;
pub use server::Server;
pub use session::Session;
pub use stream::Stream;
