use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Identity of the process on the other end of a pipe, as reported by the OS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Process id of the peer, when the platform exposes it.
    pub pid: Option<u32>,
    /// Effective user id of the peer (Unix only).
    pub uid: Option<u32>,
}

/// A connected local pipe stream implementing `AsyncRead + AsyncWrite`.
///
/// On Unix, this wraps a Unix domain socket stream.
/// On Windows, this wraps either end of a named pipe.
pub struct PipeStream {
    inner: PipeStreamInner,
}

enum PipeStreamInner {
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    #[cfg(windows)]
    Client(tokio::net::windows::named_pipe::NamedPipeClient),
    #[cfg(windows)]
    Server(tokio::net::windows::named_pipe::NamedPipeServer),
}

impl PipeStream {
    #[cfg(unix)]
    pub(crate) fn from_unix(stream: tokio::net::UnixStream) -> Self {
        Self {
            inner: PipeStreamInner::Unix(stream),
        }
    }

    #[cfg(windows)]
    pub(crate) fn from_client(client: tokio::net::windows::named_pipe::NamedPipeClient) -> Self {
        Self {
            inner: PipeStreamInner::Client(client),
        }
    }

    #[cfg(windows)]
    pub(crate) fn from_server(server: tokio::net::windows::named_pipe::NamedPipeServer) -> Self {
        Self {
            inner: PipeStreamInner::Server(server),
        }
    }

    /// Create a connected pair of unnamed streams.
    ///
    /// Mostly useful for tests and in-process plumbing.
    #[cfg(unix)]
    pub fn pair() -> io::Result<(Self, Self)> {
        let (left, right) = tokio::net::UnixStream::pair()?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Identity of the connected peer process.
    ///
    /// Returns `None` when the OS refuses or cannot answer the query.
    pub fn peer_identity(&self) -> Option<PeerIdentity> {
        match &self.inner {
            #[cfg(unix)]
            PipeStreamInner::Unix(stream) => {
                let cred = stream.peer_cred().ok()?;
                Some(PeerIdentity {
                    pid: cred.pid().and_then(|pid| u32::try_from(pid).ok()),
                    uid: Some(cred.uid()),
                })
            }
            #[cfg(windows)]
            PipeStreamInner::Client(client) => {
                windows_peer_pid(client, true).map(|pid| PeerIdentity {
                    pid: Some(pid),
                    uid: None,
                })
            }
            #[cfg(windows)]
            PipeStreamInner::Server(server) => {
                windows_peer_pid(server, false).map(|pid| PeerIdentity {
                    pid: Some(pid),
                    uid: None,
                })
            }
        }
    }
}

#[cfg(windows)]
fn windows_peer_pid(handle: &impl std::os::windows::io::AsRawHandle, server_side: bool) -> Option<u32> {
    use windows_sys::Win32::System::Pipes::{
        GetNamedPipeClientProcessId, GetNamedPipeServerProcessId,
    };

    let raw = handle.as_raw_handle();
    let mut pid = 0u32;
    // SAFETY: `raw` is a live named pipe handle borrowed from the stream for the
    // duration of this call, and `pid` is a valid writable u32.
    let ok = unsafe {
        if server_side {
            GetNamedPipeServerProcessId(raw as _, &mut pid)
        } else {
            GetNamedPipeClientProcessId(raw as _, &mut pid)
        }
    };
    (ok != 0).then_some(pid)
}

impl AsyncRead for PipeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            PipeStreamInner::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(windows)]
            PipeStreamInner::Client(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(windows)]
            PipeStreamInner::Server(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PipeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            PipeStreamInner::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(windows)]
            PipeStreamInner::Client(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(windows)]
            PipeStreamInner::Server(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            PipeStreamInner::Unix(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(windows)]
            PipeStreamInner::Client(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(windows)]
            PipeStreamInner::Server(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            PipeStreamInner::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(windows)]
            PipeStreamInner::Client(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(windows)]
            PipeStreamInner::Server(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for PipeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            #[cfg(unix)]
            PipeStreamInner::Unix(_) => "unix",
            #[cfg(windows)]
            PipeStreamInner::Client(_) => "named-pipe-client",
            #[cfg(windows)]
            PipeStreamInner::Server(_) => "named-pipe-server",
        };
        f.debug_struct("PipeStream").field("type", &kind).finish()
    }
}
