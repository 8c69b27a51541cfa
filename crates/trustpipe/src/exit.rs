use std::fmt;
use std::io;

use trustpipe_channel::ChannelError;
use trustpipe_frame::FrameError;
use trustpipe_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const TRUST_FAILED: i32 = 40;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Connect { ref source, .. } | TransportError::Accept(ref source)
            if source.kind() != io::ErrorKind::PermissionDenied =>
        {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::ConnectTimeout { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        TransportError::InvalidName { .. } | TransportError::PathTooLong { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::TruncatedFrame { .. } => CliError::new(FAILURE, format!("{context}: {err}")),
    }
}

pub fn channel_error(context: &str, err: ChannelError) -> CliError {
    match err {
        ChannelError::Transport(err) => transport_error(context, err),
        ChannelError::Frame(err) => frame_error(context, err),
        ChannelError::SignatureCheckFailed(_)
        | ChannelError::SignatureIndeterminate(_)
        | ChannelError::HandshakeVerificationFailed => {
            CliError::new(TRUST_FAILED, format!("{context}: {err}"))
        }
        ChannelError::HandshakeTimeout(_) | ChannelError::Timeout(_) => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        ChannelError::MalformedMessage(_) | ChannelError::Json(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        ChannelError::Key(_) => CliError::new(USAGE, format!("{context}: {err}")),
        ChannelError::NotConnected
        | ChannelError::HandshakeInProgress
        | ChannelError::Disconnected(_)
        | ChannelError::StreamDisposedRace(_) => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        ChannelError::Crypto(_) => CliError::new(INTERNAL, format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;

    #[test]
    fn trust_failures_share_exit_code() {
        let err = channel_error("connect failed", ChannelError::HandshakeVerificationFailed);
        assert_eq!(err.code, TRUST_FAILED);
        assert!(err.message.starts_with("connect failed: "));
    }

    #[test]
    fn timeouts_map_to_timeout_code() {
        let err = channel_error(
            "connect failed",
            ChannelError::Transport(TransportError::ConnectTimeout {
                path: PathBuf::from("/tmp/x.sock"),
                timeout: Duration::from_secs(1),
            }),
        );
        assert_eq!(err.code, TIMEOUT);
        assert_eq!(
            channel_error("wait", ChannelError::HandshakeTimeout(Duration::from_secs(30))).code,
            TIMEOUT
        );
    }

    #[test]
    fn refused_connect_is_transport_error() {
        let err = transport_error(
            "connect failed",
            TransportError::Connect {
                path: PathBuf::from("/tmp/x.sock"),
                source: io::Error::from(io::ErrorKind::ConnectionReset),
            },
        );
        assert_eq!(err.code, TRANSPORT_ERROR);
    }

    #[test]
    fn permission_denied_io_maps_to_permission_code() {
        let err = transport_error(
            "bind failed",
            TransportError::Bind {
                path: PathBuf::from("/root/x.sock"),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            },
        );
        assert_eq!(err.code, PERMISSION_DENIED);
    }
}
