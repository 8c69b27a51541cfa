use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trustpipe_transport::{Endpoint, PipeListener};

use crate::channel::{ChannelConfig, ChannelEvent, PipeChannel};
use crate::dispatch::{DispatchResponse, Dispatcher};
use crate::error::Result;

/// Service-side settings.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Settings applied to every accepted channel.
    pub channel: ChannelConfig,
    /// Socket file mode (Unix). `None` keeps the listener default of `0600`.
    pub socket_mode: Option<u32>,
}

/// Accepts clients on a named pipe and answers their requests.
pub struct PipeServer {
    listener: PipeListener,
    config: ServerConfig,
    next_connection_id: AtomicU64,
}

impl PipeServer {
    /// Bind the pipe called `name` with default settings.
    pub fn bind(name: &str) -> Result<Self> {
        Self::with_config(name, ServerConfig::default())
    }

    pub fn with_config(name: &str, config: ServerConfig) -> Result<Self> {
        #[cfg(unix)]
        let listener = match config.socket_mode {
            Some(mode) => PipeListener::bind_with_mode(name, mode)?,
            None => PipeListener::bind(name)?,
        };
        #[cfg(not(unix))]
        let listener = PipeListener::bind(name)?;

        info!(
            endpoint = %listener.endpoint(),
            transport = listener.transport_name(),
            "pipe server listening"
        );
        Ok(Self {
            listener,
            config,
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// Accept the next client as a trusted channel.
    pub async fn accept(&self) -> Result<PipeChannel> {
        let stream = self.listener.accept().await?;
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let peer = stream.peer_identity();
        debug!(connection = id, ?peer, "accepted client");
        Ok(PipeChannel::accepted(
            format!("{}#{id}", self.listener.endpoint().name()),
            stream,
            self.config.channel.clone(),
        ))
    }

    /// Accept and serve clients until `shutdown` fires.
    ///
    /// Each connection runs on its own task. Open connections are closed when
    /// the server stops.
    pub async fn serve(&self, dispatcher: Dispatcher, shutdown: CancellationToken) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = finished {
                        error!(error = %err, "connection task failed");
                    }
                    continue;
                }
                accepted = self.accept() => accepted,
            };

            match accepted {
                Ok(channel) => {
                    connections.spawn(serve_connection(
                        channel,
                        dispatcher.clone(),
                        shutdown.child_token(),
                    ));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }

        info!(open = connections.len(), "pipe server shutting down");
        while connections.join_next().await.is_some() {}
        Ok(())
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.listener.endpoint()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Answer requests on one channel until the peer leaves or `shutdown` fires.
///
/// Handlers run on the blocking pool; a panicking handler is answered with
/// the request error string and the connection stays up.
pub async fn serve_connection(
    channel: PipeChannel,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
) {
    let name = channel.name().to_string();
    let mut served = 0u64;

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = channel.recv_event() => event,
        };

        let payload = match event {
            Some(ChannelEvent::Message(payload)) => payload,
            Some(ChannelEvent::Closed) | None => break,
        };

        let worker = dispatcher.clone();
        let response = tokio::task::spawn_blocking(move || worker.dispatch(&payload))
            .await
            .unwrap_or_else(|err| {
                error!(connection = %name, error = %err, "request handler panicked");
                DispatchResponse::request_error()
            });

        if let Err(err) = channel.send(response.into_payload()).await {
            warn!(connection = %name, error = %err, "failed to send response");
            break;
        }
        served += 1;
    }

    debug!(connection = %name, served, "connection finished");
    channel.disconnect();
}
