//! Trusted request channel between a privileged local service and its clients.
//!
//! trustpipe carries length-prefixed messages over a named local pipe (Unix
//! domain sockets or Windows named pipes) and refuses to deliver anything
//! until the peer is trusted, either by an OS-level process check or by an
//! encrypted-nonce challenge.
//!
//! # Crate Structure
//!
//! - [`transport`]: Pipe naming, listeners, connect with timeout
//! - [`frame`]: Length-prefixed framing codec
//! - [`channel`]: Trust handshake, [`PipeChannel`], request dispatch, server

/// Re-export transport types.
pub mod transport {
    pub use trustpipe_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use trustpipe_frame::*;
}

/// Re-export channel types.
pub mod channel {
    pub use trustpipe_channel::*;
}

pub use trustpipe_channel::{
    ChannelError, ChannelEvent, ClientRequest, Dispatcher, PipeChannel, PipeServer, TrustState,
};
