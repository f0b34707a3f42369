//! Noise based secure channel. Sessions run the XK pattern over their TCP connection, streams run
//!  KK with the handshake messages embedded in the stream dial request and response.

pub mod noise;
pub mod read_writer;

pub use noise::{Noise, NoiseConfig, Pattern};
pub use read_writer::ReadWriter;
