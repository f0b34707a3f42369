//! Stream multiplexer running inside a session's secure channel. Every sub-stream has its own
//!  flow control window in each direction, so a slow reader on one sub-stream neither blocks other
//!  sub-streams nor causes unbounded buffering.

pub mod frame;
pub mod session;
pub mod stream;
pub mod window;

pub use session::{MuxRole, MuxSession};
pub use stream::MuxStream;
