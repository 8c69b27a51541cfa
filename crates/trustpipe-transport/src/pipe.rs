use std::time::Duration;

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::stream::PipeStream;

/// Listens on a named local pipe and accepts connections.
pub struct PipeListener {
    endpoint: Endpoint,
    #[cfg(unix)]
    inner: crate::uds::UnixSocketListener,
    #[cfg(windows)]
    inner: crate::named_pipe::NamedPipeListener,
}

impl PipeListener {
    /// Bind the endpoint for `name`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(name: &str) -> Result<Self> {
        let endpoint = Endpoint::from_name(name)?;
        #[cfg(unix)]
        let inner = crate::uds::UnixSocketListener::bind(endpoint.path())?;
        #[cfg(windows)]
        let inner = crate::named_pipe::NamedPipeListener::bind(endpoint.path())?;

        Ok(Self { endpoint, inner })
    }

    /// Bind with an explicit socket file mode (Unix only).
    #[cfg(unix)]
    pub fn bind_with_mode(name: &str, mode: u32) -> Result<Self> {
        let endpoint = Endpoint::from_name(name)?;
        let inner = crate::uds::UnixSocketListener::bind_with_mode(endpoint.path(), mode)?;
        Ok(Self { endpoint, inner })
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<PipeStream> {
        self.inner.accept().await
    }

    /// The endpoint this listener is bound to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        if cfg!(windows) {
            "named-pipe"
        } else {
            "unix-domain-socket"
        }
    }
}

/// Connect to the pipe called `name`, waiting up to `timeout` for a listener.
pub async fn connect(name: &str, timeout: Duration) -> Result<PipeStream> {
    let endpoint = Endpoint::from_name(name)?;
    debug!(%endpoint, ?timeout, "connecting to pipe");

    #[cfg(unix)]
    {
        crate::uds::connect(endpoint.path(), timeout).await
    }
    #[cfg(windows)]
    {
        crate::named_pipe::connect(endpoint.path(), timeout).await
    }
}
