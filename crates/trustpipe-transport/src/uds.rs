use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::error::{Result, TransportError};
use crate::stream::PipeStream;
use crate::CONNECT_RETRY_INTERVAL;

/// Unix domain socket listener backing a pipe endpoint.
///
/// The socket file is created with restrictive permissions and removed on
/// `Drop`, but only if the path still refers to the socket this listener created.
pub struct UnixSocketListener {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl UnixSocketListener {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind with the default socket mode.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind with an explicit socket mode.
    ///
    /// If the path already exists and is a socket, it is removed first (stale
    /// socket cleanup). Any other kind of file is left alone and binding fails.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bind_err = |path: &Path, source: std::io::Error| TransportError::Bind {
            path: path.to_path_buf(),
            source,
        };

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_err(
                    &path,
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                ));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(|e| bind_err(&path, e))?;
        }

        let listener = UnixListener::bind(&path).map_err(|e| bind_err(&path, e))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| bind_err(&path, e))?;
        let created = std::fs::symlink_metadata(&path).map_err(|e| bind_err(&path, e))?;

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            created_inode: Some((created.dev(), created.ino())),
            path,
        })
    }

    /// Accept the next incoming connection.
    pub async fn accept(&self) -> Result<PipeStream> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted connection");
        Ok(PipeStream::from_unix(stream))
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        let Some((expected_dev, expected_ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(
                    path = ?self.path,
                    "socket path identity changed; skipping cleanup"
                );
            }
        }
    }
}

/// Connect to a listening socket, waiting up to `timeout` for it to appear.
///
/// A missing socket or a refused connection is retried until the deadline;
/// any other error fails immediately.
pub async fn connect(path: impl AsRef<Path>, timeout: Duration) -> Result<PipeStream> {
    let path = path.as_ref();
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = tokio::time::timeout(remaining, UnixStream::connect(path)).await;

        match attempt {
            Ok(Ok(stream)) => {
                debug!(?path, "connected to unix domain socket");
                return Ok(PipeStream::from_unix(stream));
            }
            Ok(Err(err)) if is_retryable(&err) && Instant::now() < deadline => {
                trace!(?path, error = %err, "listener not ready; retrying");
                tokio::time::sleep(CONNECT_RETRY_INTERVAL.min(remaining)).await;
            }
            Ok(Err(err)) if is_retryable(&err) => break,
            Ok(Err(err)) => {
                return Err(TransportError::Connect {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
            Err(_elapsed) => break,
        }
    }

    Err(TransportError::ConnectTimeout {
        path: path.to_path_buf(),
        timeout,
    })
}

fn is_retryable(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
    )
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn temp_sock_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "tpt-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn bind_accept_connect() {
        let dir = temp_sock_dir("bac");
        let sock_path = dir.join("test.sock");

        let listener = UnixSocketListener::bind(&sock_path).unwrap();
        assert!(sock_path.exists());

        let path_clone = sock_path.clone();
        let client = tokio::spawn(async move {
            let mut client = connect(&path_clone, Duration::from_secs(1)).await.unwrap();
            client.write_all(b"hello").await.unwrap();
        });

        let mut server = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        client.await.unwrap();

        drop(listener);
        assert!(
            !sock_path.exists(),
            "socket file should be cleaned up on drop"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = UnixSocketListener::bind(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[tokio::test]
    async fn bind_default_permissions_hardened() {
        let dir = temp_sock_dir("perm");
        let sock_path = dir.join("perm.sock");

        let listener = UnixSocketListener::bind(&sock_path).unwrap();
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn bind_rejects_existing_non_socket_file() {
        let dir = temp_sock_dir("file");
        let sock_path = dir.join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").unwrap();

        let result = UnixSocketListener::bind(&sock_path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));
        assert!(sock_path.exists(), "regular file must not be removed");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn drop_does_not_remove_replaced_path() {
        let dir = temp_sock_dir("drop");
        let sock_path = dir.join("drop.sock");

        let listener = UnixSocketListener::bind(&sock_path).unwrap();
        std::fs::remove_file(&sock_path).unwrap();
        std::fs::write(&sock_path, b"replacement-file").unwrap();

        drop(listener);
        assert!(
            sock_path.exists(),
            "drop must not remove path if inode identity changed"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn connect_times_out_without_listener() {
        let dir = temp_sock_dir("timeout");
        let sock_path = dir.join("nobody.sock");

        let started = std::time::Instant::now();
        let result = connect(&sock_path, Duration::from_millis(120)).await;
        assert!(matches!(result, Err(TransportError::ConnectTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(100));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn connect_waits_for_late_listener() {
        let dir = temp_sock_dir("late");
        let sock_path = dir.join("late.sock");

        let path_clone = sock_path.clone();
        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let listener = UnixSocketListener::bind(&path_clone).unwrap();
            let _stream = listener.accept().await.unwrap();
        });

        let stream = connect(&sock_path, Duration::from_secs(3)).await;
        assert!(stream.is_ok());
        server.await.unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }
}
