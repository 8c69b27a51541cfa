use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use windows_sys::Win32::Foundation::ERROR_PIPE_BUSY;

use crate::error::{Result, TransportError};
use crate::stream::PipeStream;
use crate::CONNECT_RETRY_INTERVAL;

/// Windows named pipe listener.
///
/// Keeps one unconnected server instance ready so clients never observe a gap
/// between accepts.
pub struct NamedPipeListener {
    path: PathBuf,
    pending: Mutex<NamedPipeServer>,
}

impl NamedPipeListener {
    /// Create the first pipe instance. Fails if another process owns the name.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&path)
            .map_err(|source| TransportError::Bind {
                path: path.clone(),
                source,
            })?;

        info!(?path, "listening on named pipe");
        Ok(Self {
            path,
            pending: Mutex::new(server),
        })
    }

    /// Wait for a client on the pending instance and hand it out.
    pub async fn accept(&self) -> Result<PipeStream> {
        let mut pending = self.pending.lock().await;
        pending.connect().await.map_err(TransportError::Accept)?;

        let next = ServerOptions::new()
            .create(&self.path)
            .map_err(TransportError::Accept)?;
        let connected = std::mem::replace(&mut *pending, next);
        debug!(path = ?self.path, "accepted named pipe client");
        Ok(PipeStream::from_server(connected))
    }

    /// The pipe path this listener serves.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Open a named pipe, waiting up to `timeout` while it is missing or busy.
pub async fn connect(path: impl AsRef<Path>, timeout: Duration) -> Result<PipeStream> {
    let path = path.as_ref();
    let deadline = Instant::now() + timeout;

    loop {
        match ClientOptions::new().open(path) {
            Ok(client) => {
                debug!(?path, "connected to named pipe");
                return Ok(PipeStream::from_client(client));
            }
            Err(err) if is_retryable(&err) && Instant::now() < deadline => {
                trace!(?path, error = %err, "named pipe not ready; retrying");
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(CONNECT_RETRY_INTERVAL.min(remaining)).await;
            }
            Err(err) if is_retryable(&err) => {
                return Err(TransportError::ConnectTimeout {
                    path: path.to_path_buf(),
                    timeout,
                })
            }
            Err(err) => {
                return Err(TransportError::Connect {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }
}

fn is_retryable(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::NotFound || err.raw_os_error() == Some(ERROR_PIPE_BUSY as i32)
}
