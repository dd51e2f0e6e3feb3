//! Loopback transport between the injected tracer and the capture host.
//!
//! - [`stream`]: TCP message stream with handshake and send coalescing
//! - [`file_like`]: length-prefixed framing shared by sockets and files

pub mod file_like;
pub mod stream;

pub use file_like::FileLike;
pub use stream::{MessageListener, MessageStream, Role};

/// Every framed message starts with its payload length as a little-endian u64.
pub const FRAME_PREFIX_SIZE: usize = 8;
