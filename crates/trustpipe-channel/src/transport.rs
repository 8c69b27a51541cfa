//! Framed duplex link over a single pipe stream.
//!
//! A [`Transport`] owns at most one live stream. Inbound frames are read by a
//! dedicated task and handed to a [`FrameSink`]; outbound frames go through a
//! writer guarded by an async mutex, so concurrent senders never interleave.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use trustpipe_frame::{FrameConfig, PipeCodec};
use trustpipe_transport::{PeerIdentity, PipeStream};

use crate::error::{ChannelError, Result};

type Writer = FramedWrite<WriteHalf<PipeStream>, PipeCodec>;
type Reader = FramedRead<ReadHalf<PipeStream>, PipeCodec>;

/// Receives what the read loop produces.
///
/// Called from the read task; implementations must not block.
pub trait FrameSink: Send + Sync + 'static {
    /// A complete non-empty frame arrived.
    fn on_frame(&self, payload: Bytes);

    /// The peer closed the link. Called at most once per connection.
    ///
    /// Runs while the link is being torn down: the transport reports
    /// disconnected only after this returns, and a new link cannot be
    /// attached until then. Must not call back into the transport.
    fn on_closed(&self);
}

/// Write half of the live link. Emptied on teardown so the stream is
/// released even while senders still hold the mutex handle.
type SharedWriter = Arc<tokio::sync::Mutex<Option<Writer>>>;

struct ActiveLink {
    cancel: CancellationToken,
    writer: SharedWriter,
    peer: Option<PeerIdentity>,
}

impl ActiveLink {
    /// Stop the read loop and drop the writer unless a send holds it; that
    /// send sees the cancellation and drops its handle.
    fn shut(self) {
        self.cancel.cancel();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}

#[derive(Default)]
struct LinkState {
    generation: u64,
    active: Option<ActiveLink>,
}

/// A connection to one named pipe.
pub struct Transport {
    name: String,
    config: FrameConfig,
    link: Arc<Mutex<LinkState>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Transport {
    /// A disconnected transport for the pipe called `name`.
    pub fn new(name: impl Into<String>, config: FrameConfig) -> Self {
        Self {
            name: name.into(),
            config,
            link: Arc::new(Mutex::new(LinkState::default())),
        }
    }

    /// Adopt an already connected stream, e.g. one accepted by a listener.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream(
        name: impl Into<String>,
        config: FrameConfig,
        stream: PipeStream,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        let transport = Self::new(name, config);
        transport.attach(stream, sink);
        transport
    }

    /// Open the pipe and start reading. A no-op while already connected.
    pub async fn connect(&self, timeout: Duration, sink: Arc<dyn FrameSink>) -> Result<()> {
        if self.is_connected() {
            debug!(name = %self.name, "transport already connected");
            return Ok(());
        }
        let stream = trustpipe_transport::connect(&self.name, timeout).await?;
        self.attach(stream, sink);
        Ok(())
    }

    /// Install `stream` as the live link and spawn its read loop.
    pub(crate) fn attach(&self, stream: PipeStream, sink: Arc<dyn FrameSink>) {
        let peer = stream.peer_identity();
        let (read_half, write_half) = tokio::io::split(stream);
        let codec = PipeCodec::new(self.config.clone());
        let reader = FramedRead::new(read_half, codec.clone());
        let writer = FramedWrite::new(write_half, codec);

        let cancel = CancellationToken::new();
        let generation = {
            let mut link = self.lock_link();
            if link.active.is_some() {
                debug!(name = %self.name, "dropping surplus stream; link already active");
                return;
            }
            link.generation += 1;
            link.active = Some(ActiveLink {
                cancel: cancel.clone(),
                writer: Arc::new(tokio::sync::Mutex::new(Some(writer))),
                peer,
            });
            link.generation
        };

        debug!(name = %self.name, generation, ?peer, "transport attached");
        tokio::spawn(read_loop(
            self.name.clone(),
            reader,
            cancel,
            Arc::clone(&self.link),
            generation,
            sink,
        ));
    }

    /// Frame and write one message.
    ///
    /// A send waiting for the writer, or blocked mid-write, is abandoned when
    /// the link is torn down and reports [`ChannelError::NotConnected`].
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        let (writer, cancel, generation) = {
            let link = self.lock_link();
            let active = link.active.as_ref().ok_or(ChannelError::NotConnected)?;
            (
                Arc::clone(&active.writer),
                active.cancel.clone(),
                link.generation,
            )
        };

        let size = payload.len();
        let write = async {
            let mut guard = writer.lock().await;
            match guard.as_mut() {
                Some(framed) if self.is_live(generation) => Some(framed.send(payload).await),
                _ => None,
            }
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = write => outcome,
        };

        let Some(result) = outcome else {
            debug!(
                name = %self.name,
                error = %ChannelError::StreamDisposedRace("write"),
                "write abandoned; link torn down"
            );
            if let Ok(mut guard) = writer.try_lock() {
                guard.take();
            }
            return Err(ChannelError::NotConnected);
        };

        match result {
            Ok(()) => {
                trace!(name = %self.name, size, "frame written");
                Ok(())
            }
            Err(err) if !self.is_live(generation) => {
                debug!(
                    name = %self.name,
                    error = %ChannelError::StreamDisposedRace("write"),
                    cause = %err,
                    "write raced disconnect"
                );
                Err(ChannelError::NotConnected)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Close and release the stream. Pending writes are not drained.
    pub fn disconnect(&self) {
        let taken = self.lock_link().active.take();
        if let Some(active) = taken {
            active.shut();
            debug!(name = %self.name, "transport disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock_link().active.is_some()
    }

    /// OS-reported identity of the peer process on the live link.
    pub fn peer_identity(&self) -> Option<PeerIdentity> {
        self.lock_link().active.as_ref().and_then(|active| active.peer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_live(&self, generation: u64) -> bool {
        let link = self.lock_link();
        link.generation == generation && link.active.is_some()
    }

    fn lock_link(&self) -> MutexGuard<'_, LinkState> {
        lock_link(&self.link)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn lock_link(link: &Mutex<LinkState>) -> MutexGuard<'_, LinkState> {
    link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Remove the link for `generation` if it is still installed and tell the
/// sink, all under the link lock.
fn teardown(link: &Mutex<LinkState>, generation: u64, sink: &dyn FrameSink) {
    let mut state = lock_link(link);
    if state.generation != generation {
        return;
    }
    let Some(active) = state.active.take() else {
        return;
    };
    active.shut();
    sink.on_closed();
}

async fn read_loop(
    name: String,
    mut reader: Reader,
    cancel: CancellationToken,
    link: Arc<Mutex<LinkState>>,
    generation: u64,
    sink: Arc<dyn FrameSink>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                trace!(%name, generation, "read loop cancelled");
                return;
            }
            next = reader.next() => next,
        };

        match next {
            Some(Ok(frame)) if frame.is_close_sentinel() => {
                debug!(%name, generation, "peer sent close sentinel");
                break;
            }
            Some(Ok(frame)) => sink.on_frame(frame.payload),
            None => {
                debug!(%name, generation, "peer closed stream");
                break;
            }
            Some(Err(err)) => {
                if cancel.is_cancelled() {
                    debug!(
                        %name,
                        error = %ChannelError::StreamDisposedRace("read"),
                        cause = %err,
                        "read raced disconnect"
                    );
                    return;
                }
                warn!(%name, generation, error = %err, "stream fault; closing link");
                break;
            }
        }
    }

    drop(reader);
    teardown(&link, generation, sink.as_ref());
}
