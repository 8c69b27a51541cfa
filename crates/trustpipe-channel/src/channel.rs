use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use trustpipe_frame::FrameConfig;
use trustpipe_transport::{PeerIdentity, PipeStream, DEFAULT_CONNECT_TIMEOUT};

use crate::error::{ChannelError, Result};
use crate::keys::KeySource;
use crate::message::ClientRequest;
use crate::signature::SignatureVerifier;
use crate::transport::{FrameSink, Transport};
use crate::trust::{lock, SharedSession, TrustConfig, TrustSession, TrustState, TrustVerifier};

/// Inbound activity on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A message from the trusted peer.
    Message(Bytes),
    /// The peer closed the connection. Sent once per connection.
    Closed,
}

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// How long `connect()` waits for a listener.
    pub connect_timeout: Duration,
    /// Frame size limits.
    pub frame: FrameConfig,
    /// Trust handshake tuning.
    pub trust: TrustConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            frame: FrameConfig::default(),
            trust: TrustConfig::default(),
        }
    }
}

/// State shared between the channel and its read loop.
struct Shared {
    session: SharedSession,
    events: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl Shared {
    fn emit(&self, event: ChannelEvent) {
        let events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(tx) = events.as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Forget everything about the current connection.
    fn reset(&self) {
        lock(&self.session).reset();
        self.events.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}

impl FrameSink for Shared {
    fn on_frame(&self, payload: Bytes) {
        let admitted = lock(&self.session).admit(payload);
        if let Some(payload) = admitted {
            self.emit(ChannelEvent::Message(payload));
        }
    }

    fn on_closed(&self) {
        info!("peer closed channel");
        self.emit(ChannelEvent::Closed);
        self.reset();
    }
}

/// A trusted message channel over a named local pipe.
///
/// `connect()` opens the pipe and runs the trust handshake; messages from the
/// peer are delivered as [`ChannelEvent`]s only once trust is established.
///
/// # Example
///
/// ```rust,no_run
/// use trustpipe_channel::{ChannelEvent, PipeChannel};
///
/// # async fn demo() -> trustpipe_channel::Result<()> {
/// let channel = PipeChannel::new("my-service");
/// channel.connect().await?;
/// channel.send(r#"{"requestType":"IsUIRunningAutoupdateCheck"}"#).await?;
/// if let Some(ChannelEvent::Message(reply)) = channel.recv_event().await {
///     println!("{}", String::from_utf8_lossy(&reply));
/// }
/// # Ok(())
/// # }
/// ```
pub struct PipeChannel {
    config: ChannelConfig,
    transport: Transport,
    trust: TrustVerifier,
    shared: Arc<Shared>,
    inbound: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl std::fmt::Debug for PipeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeChannel")
            .field("name", &self.name())
            .field("connected", &self.is_connected())
            .field("trust_state", &self.trust_state())
            .finish()
    }
}

impl PipeChannel {
    /// A disconnected channel for the pipe called `name`, with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, ChannelConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: ChannelConfig) -> Self {
        let transport = Transport::new(name, config.frame.clone());
        let trust = TrustVerifier::default().with_config(config.trust.clone());
        Self {
            config,
            transport,
            trust,
            shared: Arc::new(Shared {
                session: Arc::new(Mutex::new(TrustSession::default())),
                events: Mutex::new(None),
            }),
            inbound: tokio::sync::Mutex::new(None),
        }
    }

    /// Replace the OS-level peer check.
    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.trust = std::mem::take(&mut self.trust).with_verifier(verifier);
        self
    }

    /// Key material for the challenge fallback.
    pub fn with_key_source(mut self, keys: Arc<dyn KeySource>) -> Self {
        self.trust = std::mem::take(&mut self.trust).with_key_source(keys);
        self
    }

    /// Replace the whole trust setup. Its handshake settings override
    /// `ChannelConfig::trust`.
    pub fn with_trust_verifier(mut self, trust: TrustVerifier) -> Self {
        self.config.trust = trust.config().clone();
        self.trust = trust;
        self
    }

    /// Wrap a stream accepted by a listener.
    ///
    /// The service trusts its own listener, so the channel starts out
    /// [`TrustState::SignatureValid`]. Must be called from within a tokio runtime.
    pub fn accepted(name: impl Into<String>, stream: PipeStream, config: ChannelConfig) -> Self {
        let mut channel = Self::with_config(name, config);
        let rx = channel.open_events();
        *channel.inbound.get_mut() = Some(rx);
        lock(&channel.shared.session).assume_valid();
        channel.transport.attach(stream, channel.sink());
        channel
    }

    /// Open the pipe and establish trust.
    ///
    /// On any failure the channel is disconnected before the error is
    /// returned. Calling this on a trusted channel is a no-op; calling it
    /// while another `connect()` is still in the handshake fails with
    /// [`ChannelError::HandshakeInProgress`].
    pub async fn connect(&self) -> Result<()> {
        if self.transport.is_connected() {
            if self.trust_state().is_trusted() {
                debug!(name = %self.name(), "channel already connected");
                return Ok(());
            }
            return Err(ChannelError::HandshakeInProgress);
        }

        self.shared.reset();
        let rx = self.open_events();
        *self.inbound.lock().await = Some(rx);

        if let Err(err) = self
            .transport
            .connect(self.config.connect_timeout, self.sink())
            .await
        {
            warn!(name = %self.name(), error = %err, "pipe connect failed");
            self.disconnect();
            return Err(err);
        }

        match self.trust.establish(&self.shared.session, &self.transport).await {
            Ok(state) => {
                info!(name = %self.name(), %state, "channel trusted");
                Ok(())
            }
            Err(err) => {
                warn!(
                    name = %self.name(),
                    error = %err,
                    state = ?err.trust_state(),
                    "trust handshake failed"
                );
                self.disconnect();
                Err(err)
            }
        }
    }

    /// Send one message to the peer.
    ///
    /// An empty message would read as the close sentinel and is rejected.
    pub async fn send(&self, message: impl Into<Bytes>) -> Result<()> {
        let message = message.into();
        if message.is_empty() {
            return Err(ChannelError::MalformedMessage(
                "empty messages cannot be sent".to_string(),
            ));
        }
        if !self.trust_state().is_trusted() {
            return Err(ChannelError::NotConnected);
        }
        self.transport.send(message).await
    }

    /// Serialize and send a request.
    pub async fn send_request(&self, request: &ClientRequest) -> Result<()> {
        self.send(request.to_vec()?).await
    }

    /// Send a request and wait for the next message from the peer.
    pub async fn request(&self, request: &ClientRequest, timeout: Duration) -> Result<Bytes> {
        self.send_request(request).await?;
        match tokio::time::timeout(timeout, self.recv_event()).await {
            Ok(Some(ChannelEvent::Message(reply))) => Ok(reply),
            Ok(Some(ChannelEvent::Closed)) | Ok(None) => Err(ChannelError::Disconnected(
                "connection closed before reply".to_string(),
            )),
            Err(_) => Err(ChannelError::Timeout(timeout)),
        }
    }

    /// Next inbound event, or `None` once the connection is gone and drained.
    pub async fn recv_event(&self) -> Option<ChannelEvent> {
        let mut inbound = self.inbound.lock().await;
        inbound.as_mut()?.recv().await
    }

    /// Take the event receiver for the current connection, for consumption
    /// on a dedicated task. Returns `None` if already taken.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.inbound.lock().await.take()
    }

    /// Tell the peer we are closing, then disconnect.
    pub async fn close(&self) {
        if self.transport.is_connected() {
            if let Err(err) = self.transport.send(Bytes::new()).await {
                debug!(name = %self.name(), error = %err, "close sentinel not delivered");
            }
        }
        self.disconnect();
    }

    /// Drop the connection and reset per-connection state. Idempotent.
    pub fn disconnect(&self) {
        self.transport.disconnect();
        self.shared.reset();
    }

    pub fn trust_state(&self) -> TrustState {
        lock(&self.shared.session).state()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn peer_identity(&self) -> Option<PeerIdentity> {
        self.transport.peer_identity()
    }

    pub fn name(&self) -> &str {
        self.transport.name()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn open_events(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.events.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        rx
    }

    fn sink(&self) -> Arc<dyn FrameSink> {
        self.shared.clone()
    }
}

impl Drop for PipeChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use trustpipe_transport::{PipeListener, TransportError};

    use super::*;
    use crate::challenge::respond_to_challenge;
    use crate::keys::test_keys;
    use crate::message::VALIDATE_SERVER_SIGNATURE;
    use crate::signature::{FixedStatus, SignatureStatus};

    fn socket_name(tag: &str) -> String {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        std::env::temp_dir()
            .join(format!(
                "trustpipe-channel-{tag}-{}-{}.sock",
                std::process::id(),
                NEXT.fetch_add(1, Ordering::SeqCst)
            ))
            .to_string_lossy()
            .into_owned()
    }

    fn client(name: &str, status: SignatureStatus) -> PipeChannel {
        PipeChannel::new(name).with_verifier(Arc::new(FixedStatus(status)))
    }

    async fn accept(listener: &PipeListener) -> PipeChannel {
        let stream = listener.accept().await.unwrap();
        PipeChannel::accepted(listener.endpoint().name(), stream, ChannelConfig::default())
    }

    /// Accept one connection and answer its trust challenge with `answer`.
    fn spawn_challenge_server(
        listener: PipeListener,
        answer: fn(&str) -> Vec<u8>,
    ) -> tokio::task::JoinHandle<PipeChannel> {
        tokio::spawn(async move {
            let server = accept(&listener).await;
            let Some(ChannelEvent::Message(raw)) = server.recv_event().await else {
                panic!("expected challenge request");
            };
            let request = ClientRequest::from_slice(&raw).unwrap();
            assert_eq!(request.request_type, VALIDATE_SERVER_SIGNATURE);
            let encrypted = request.argument(VALIDATE_SERVER_SIGNATURE).unwrap();
            server.send(answer(encrypted)).await.unwrap();
            server
        })
    }

    fn honest_answer(encrypted: &str) -> Vec<u8> {
        respond_to_challenge(&test_keys::shared(), encrypted).unwrap()
    }

    #[tokio::test]
    async fn signature_success_trusts_and_delivers() {
        let name = socket_name("valid");
        let listener = PipeListener::bind(&name).unwrap();
        let channel = client(&name, SignatureStatus::Success);

        let (connected, server) = tokio::join!(channel.connect(), accept(&listener));
        connected.unwrap();
        assert_eq!(channel.trust_state(), TrustState::SignatureValid);
        assert!(channel.is_connected());

        channel.send("ping").await.unwrap();
        assert_eq!(
            server.recv_event().await,
            Some(ChannelEvent::Message(Bytes::from_static(b"ping")))
        );

        let reply = {
            let send = server.send("pong");
            let (sent, reply) = tokio::join!(send, channel.recv_event());
            sent.unwrap();
            reply
        };
        assert_eq!(reply, Some(ChannelEvent::Message(Bytes::from_static(b"pong"))));
    }

    #[tokio::test]
    async fn failed_signature_disconnects() {
        let name = socket_name("invalid");
        let listener = PipeListener::bind(&name).unwrap();
        let channel = client(&name, SignatureStatus::SignFailed);

        let (connected, server) = tokio::join!(channel.connect(), accept(&listener));
        let err = connected.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::SignatureCheckFailed(SignatureStatus::SignFailed)
        ));
        assert_eq!(err.trust_state(), Some(TrustState::SignatureInvalid));
        assert!(!channel.is_connected());
        assert_eq!(channel.trust_state(), TrustState::Unknown);

        assert_eq!(server.recv_event().await, Some(ChannelEvent::Closed));
    }

    #[tokio::test]
    async fn challenge_success_consumes_response() {
        let name = socket_name("challenge");
        let listener = PipeListener::bind(&name).unwrap();
        let server = spawn_challenge_server(listener, honest_answer);

        let channel = client(&name, SignatureStatus::AccessDenied)
            .with_key_source(Arc::new(test_keys::shared().public_only()));
        channel.connect().await.unwrap();
        assert_eq!(channel.trust_state(), TrustState::ChallengeVerified);

        let server = server.await.unwrap();
        server.send("hello").await.unwrap();
        assert_eq!(
            channel.recv_event().await,
            Some(ChannelEvent::Message(Bytes::from_static(b"hello")))
        );
    }

    #[tokio::test]
    async fn challenge_mismatch_fails_and_disconnects() {
        let name = socket_name("mismatch");
        let listener = PipeListener::bind(&name).unwrap();
        let server = spawn_challenge_server(listener, |_| b"not a signature".to_vec());

        let channel = client(&name, SignatureStatus::AccessDenied)
            .with_key_source(Arc::new(test_keys::shared().public_only()));
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, ChannelError::HandshakeVerificationFailed));
        assert_eq!(err.trust_state(), Some(TrustState::ChallengeFailed));
        assert!(!channel.is_connected());

        let server = server.await.unwrap();
        assert_eq!(server.recv_event().await, Some(ChannelEvent::Closed));
    }

    #[tokio::test]
    async fn challenge_without_answer_times_out() {
        let name = socket_name("timeout");
        let listener = PipeListener::bind(&name).unwrap();
        let mut config = ChannelConfig::default();
        config.trust.handshake_timeout = Duration::from_millis(150);
        let channel = PipeChannel::with_config(&name, config)
            .with_verifier(Arc::new(FixedStatus(SignatureStatus::AccessDenied)))
            .with_key_source(Arc::new(test_keys::shared().public_only()));

        let (connected, _server) = tokio::join!(channel.connect(), accept(&listener));
        let err = connected.unwrap_err();
        assert!(matches!(err, ChannelError::HandshakeTimeout(_)));
        assert_eq!(err.trust_state(), Some(TrustState::ChallengeFailed));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn indeterminate_without_keys_fails() {
        let name = socket_name("nokeys");
        let listener = PipeListener::bind(&name).unwrap();
        let channel = client(&name, SignatureStatus::AccessDenied);

        let (connected, _server) = tokio::join!(channel.connect(), accept(&listener));
        assert!(matches!(
            connected,
            Err(ChannelError::SignatureIndeterminate(_))
        ));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn reconnect_after_disconnect_behaves_fresh() {
        let name = socket_name("reset");
        let listener = PipeListener::bind(&name).unwrap();
        let channel = client(&name, SignatureStatus::Success);

        let (first, _server) = tokio::join!(channel.connect(), accept(&listener));
        first.unwrap();
        channel.disconnect();
        channel.disconnect();
        assert_eq!(channel.trust_state(), TrustState::Unknown);
        assert!(!channel.is_connected());
        assert_eq!(channel.recv_event().await, None);

        let (second, server) = tokio::join!(channel.connect(), accept(&listener));
        second.unwrap();
        assert_eq!(channel.trust_state(), TrustState::SignatureValid);
        channel.send("again").await.unwrap();
        assert_eq!(
            server.recv_event().await,
            Some(ChannelEvent::Message(Bytes::from_static(b"again")))
        );
    }

    #[tokio::test]
    async fn peer_close_emits_single_closed_event() {
        let name = socket_name("close");
        let listener = PipeListener::bind(&name).unwrap();
        let channel = client(&name, SignatureStatus::Success);

        let (connected, server) = tokio::join!(channel.connect(), accept(&listener));
        connected.unwrap();

        server.close().await;
        assert_eq!(channel.recv_event().await, Some(ChannelEvent::Closed));
        assert_eq!(channel.recv_event().await, None);
        assert!(!channel.is_connected());
        assert_eq!(channel.trust_state(), TrustState::Unknown);
    }

    #[tokio::test]
    async fn connect_times_out_without_listener() {
        let name = socket_name("absent");
        let config = ChannelConfig {
            connect_timeout: Duration::from_millis(100),
            ..ChannelConfig::default()
        };
        let channel = PipeChannel::with_config(&name, config);

        let err = channel.connect().await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Transport(TransportError::ConnectTimeout { .. })
        ));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn send_requires_connection_and_payload() {
        let channel = PipeChannel::new(socket_name("idle"));
        assert!(matches!(
            channel.send("x").await,
            Err(ChannelError::NotConnected)
        ));
        assert!(matches!(
            channel.send(Bytes::new()).await,
            Err(ChannelError::MalformedMessage(_))
        ));
    }

    #[tokio::test]
    async fn request_returns_next_message() {
        let name = socket_name("request");
        let listener = PipeListener::bind(&name).unwrap();
        let channel = client(&name, SignatureStatus::Success);

        let (connected, server) = tokio::join!(channel.connect(), accept(&listener));
        connected.unwrap();

        let responder = tokio::spawn(async move {
            let Some(ChannelEvent::Message(raw)) = server.recv_event().await else {
                panic!("expected request");
            };
            let request = ClientRequest::from_slice(&raw).unwrap();
            assert_eq!(request.request_type, "IsUIRunningAutoupdateCheck");
            server.send("True").await.unwrap();
            server
        });

        let reply = channel
            .request(
                &ClientRequest::new("IsUIRunningAutoupdateCheck"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(reply.as_ref(), b"True");
        let _server = responder.await.unwrap();
    }

    /// Start a `connect()` against a service that accepts but never answers
    /// the challenge, and wait until the challenge is out.
    async fn stalled_handshake(
        tag: &str,
    ) -> (
        Arc<PipeChannel>,
        tokio::task::JoinHandle<Result<()>>,
        PipeChannel,
    ) {
        let name = socket_name(tag);
        let listener = PipeListener::bind(&name).unwrap();
        let channel = Arc::new(
            PipeChannel::new(&name)
                .with_verifier(Arc::new(FixedStatus(SignatureStatus::AccessDenied)))
                .with_key_source(Arc::new(test_keys::shared().public_only())),
        );

        let connecting = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.connect().await }
        });
        let server = accept(&listener).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while channel.trust_state() != TrustState::ChallengeSent {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("challenge sent");
        (channel, connecting, server)
    }

    #[tokio::test]
    async fn disconnect_releases_connect_waiting_on_challenge() {
        let (channel, connecting, _server) = stalled_handshake("release").await;

        tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.disconnect() }
        })
        .await
        .unwrap();

        // Well before the 30 s handshake timeout.
        let result = tokio::time::timeout(Duration::from_secs(5), connecting)
            .await
            .expect("connect released by disconnect")
            .unwrap();
        assert!(matches!(result, Err(ChannelError::Disconnected(_))));
        assert!(!channel.is_connected());
        assert_eq!(channel.trust_state(), TrustState::Unknown);
    }

    #[tokio::test]
    async fn second_connect_during_handshake_is_rejected() {
        let (channel, connecting, _server) = stalled_handshake("overlap").await;

        assert!(matches!(
            channel.connect().await,
            Err(ChannelError::HandshakeInProgress)
        ));
        assert!(matches!(
            channel.send("early").await,
            Err(ChannelError::NotConnected)
        ));

        channel.disconnect();
        let result = tokio::time::timeout(Duration::from_secs(5), connecting)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }
}
