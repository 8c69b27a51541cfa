//! Trusted message channel over a named local pipe.
//!
//! A client opens a [`PipeChannel`] to a privileged local service. Before any
//! message is delivered the channel establishes trust: an OS-level check of
//! the peer process, or when that cannot be performed, an encrypted-nonce
//! challenge only the service can answer. The service side accepts clients
//! with [`PipeServer`] and routes their requests through a [`Dispatcher`].

pub mod challenge;
pub mod channel;
pub mod connector;
pub mod dispatch;
pub mod error;
pub mod keys;
pub mod message;
pub mod server;
pub mod signature;
pub mod transport;
pub mod trust;

pub use challenge::{encrypt_nonce, respond_to_challenge, verify_response, Nonce};
pub use channel::{ChannelConfig, ChannelEvent, PipeChannel};
pub use connector::{connect, connect_with_config};
pub use dispatch::{
    DispatchResponse, Dispatcher, HandlerError, InstallerSettings, LaunchContext, RequestType,
    ServiceHandlers, REQUEST_ERROR, SUCCESS,
};
pub use error::{ChannelError, Result};
pub use keys::{KeyPair, KeySource, StaticKeySource, DEFAULT_KEY_BITS};
pub use message::{Argument, ClientRequest, VALIDATE_SERVER_SIGNATURE};
pub use server::{serve_connection, PipeServer, ServerConfig};
pub use signature::{
    default_verifier, FixedStatus, PeerUidVerifier, SignatureStatus, SignatureVerifier,
};
pub use transport::{FrameSink, Transport};
pub use trust::{TrustConfig, TrustState, TrustVerifier, DEFAULT_HANDSHAKE_TIMEOUT, NONCE_LEN};
