//! Local named-pipe transport.
//!
//! Provides a unified async interface over the platform's local duplex pipe:
//! - Unix domain sockets (Linux/macOS)
//! - Named pipes (Windows)
//!
//! This is the lowest layer of trustpipe. Everything else builds on top of
//! the [`PipeStream`] type provided here.

pub mod endpoint;
pub mod error;
pub mod pipe;
pub mod stream;

#[cfg(unix)]
pub mod uds;

#[cfg(windows)]
pub mod named_pipe;

pub use endpoint::{Endpoint, SOCKET_DIR_ENV};
pub use error::{Result, TransportError};
pub use pipe::{connect, PipeListener};
pub use stream::{PeerIdentity, PipeStream};

#[cfg(unix)]
pub use uds::UnixSocketListener;

/// Default time allowed for a client to reach a listening pipe.
pub const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Back-off between attempts while the listener is missing or busy.
pub(crate) const CONNECT_RETRY_INTERVAL: std::time::Duration =
    std::time::Duration::from_millis(25);
