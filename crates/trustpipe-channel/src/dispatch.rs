//! Request routing on the service side.
//!
//! The [`Dispatcher`] decodes a request, calls the matching business handler,
//! and always produces a reply. Anything it cannot serve becomes
//! [`REQUEST_ERROR`], never a panic or a silent drop.

use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::challenge::respond_to_challenge;
use crate::keys::KeySource;
use crate::message::{Argument, ClientRequest};

/// Reply for anything that cannot be served.
pub const REQUEST_ERROR: &str = "Error: invalid Request";

/// Reply for handlers that only report completion.
pub const SUCCESS: &str = "Success";

/// Request types the service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    ValidateServerSignature,
    GetLaunchArguments,
    DeRegisterWithPhomeServer,
    SaveProxy,
    GetInstallerInitialSettings,
    IsUiRunningAutoupdateCheck,
    MstDeployment,
}

impl RequestType {
    pub const ALL: [RequestType; 7] = [
        RequestType::ValidateServerSignature,
        RequestType::GetLaunchArguments,
        RequestType::DeRegisterWithPhomeServer,
        RequestType::SaveProxy,
        RequestType::GetInstallerInitialSettings,
        RequestType::IsUiRunningAutoupdateCheck,
        RequestType::MstDeployment,
    ];

    /// Name as it appears in `requestType` on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::ValidateServerSignature => "ValidateServerSignature",
            RequestType::GetLaunchArguments => "GetLaunchArguments",
            RequestType::DeRegisterWithPhomeServer => "DeRegisterWithPhomeServer",
            RequestType::SaveProxy => "SaveProxy",
            RequestType::GetInstallerInitialSettings => "GetInstallerInitialSettings",
            RequestType::IsUiRunningAutoupdateCheck => "IsUIRunningAutoupdateCheck",
            RequestType::MstDeployment => "MSTDeployement",
        }
    }
}

impl FromStr for RequestType {
    type Err = UnknownRequestType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownRequestType(s.to_string()))
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown request type: {0:?}")]
pub struct UnknownRequestType(pub String);

/// Arguments of a `GetLaunchArguments` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchContext {
    /// Which front end is launching. Defaults to `UI`.
    pub client_source: String,
    /// App package version the caller runs, for a version comparison.
    pub current_appx_version: Option<String>,
    /// The caller asks for the service's local websocket server to restart.
    pub wss_restart: bool,
    /// Local proxy port reported by a sandboxed caller.
    pub uwp_port_number: Option<String>,
}

impl Default for LaunchContext {
    fn default() -> Self {
        Self {
            client_source: DEFAULT_CLIENT_SOURCE.to_string(),
            current_appx_version: None,
            wss_restart: false,
            uwp_port_number: None,
        }
    }
}

const DEFAULT_CLIENT_SOURCE: &str = "UI";

impl LaunchContext {
    /// Pull the launch arguments out of a request. Lookups are first-match.
    pub fn from_request(request: &ClientRequest) -> Self {
        Self {
            client_source: request
                .argument("ClientSource")
                .filter(|value| !value.is_empty())
                .unwrap_or(DEFAULT_CLIENT_SOURCE)
                .to_string(),
            current_appx_version: request.argument("CurrentAppxVersion").map(str::to_string),
            wss_restart: request
                .argument("WSSRestart")
                .is_some_and(|value| value.trim().eq_ignore_ascii_case("true")),
            uwp_port_number: request.argument("UWPPortNumber").map(str::to_string),
        }
    }
}

/// Values returned for `GetInstallerInitialSettings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerSettings {
    pub user_proxy: String,
    pub privacy_setting: String,
}

/// A business handler could not serve the request.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Business operations behind the request types.
///
/// Implementations may block; the server runs them off the async runtime.
pub trait ServiceHandlers: Send + Sync {
    /// JSON document describing how the caller should start.
    fn launch_arguments(&self, context: &LaunchContext) -> Result<String, HandlerError>;

    fn deregister(&self) -> Result<(), HandlerError>;

    fn save_proxy(&self, proxy: &str) -> Result<(), HandlerError>;

    fn installer_initial_settings(&self) -> Result<InstallerSettings, HandlerError>;

    fn is_ui_running(&self) -> Result<bool, HandlerError>;

    /// Apply an encoded deployment configuration; `true` when applied.
    fn apply_mst_deployment(&self, encoded: &str) -> Result<bool, HandlerError>;
}

/// Reply produced for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResponse {
    Text(String),
    Bytes(Vec<u8>),
    Structured(ClientRequest),
}

impl DispatchResponse {
    pub fn request_error() -> Self {
        DispatchResponse::Text(REQUEST_ERROR.to_string())
    }

    /// Frame payload for this reply. Never empty: an empty frame would read
    /// as a close.
    pub fn into_payload(self) -> Bytes {
        let payload = match self {
            DispatchResponse::Text(text) => Bytes::from(text),
            DispatchResponse::Bytes(bytes) => Bytes::from(bytes),
            DispatchResponse::Structured(request) => match request.to_vec() {
                Ok(json) => Bytes::from(json),
                Err(err) => {
                    error!(error = %err, "failed to encode structured response");
                    Bytes::from_static(REQUEST_ERROR.as_bytes())
                }
            },
        };
        if payload.is_empty() {
            Bytes::from_static(REQUEST_ERROR.as_bytes())
        } else {
            payload
        }
    }
}

fn bool_text(value: bool) -> String {
    let text = if value { "True" } else { "False" };
    text.to_string()
}

/// Routes decoded requests to [`ServiceHandlers`].
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<dyn ServiceHandlers>,
    keys: Option<Arc<dyn KeySource>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("has_keys", &self.keys.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(handlers: Arc<dyn ServiceHandlers>) -> Self {
        Self {
            handlers,
            keys: None,
        }
    }

    /// Private key material for answering trust challenges.
    pub fn with_key_source(mut self, keys: Arc<dyn KeySource>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Serve one raw request payload.
    pub fn dispatch(&self, payload: &[u8]) -> DispatchResponse {
        let request = match ClientRequest::from_slice(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, size = payload.len(), "malformed request");
                return DispatchResponse::request_error();
            }
        };
        self.dispatch_request(&request)
    }

    /// Serve one decoded request.
    pub fn dispatch_request(&self, request: &ClientRequest) -> DispatchResponse {
        let kind = match request.request_type.parse::<RequestType>() {
            Ok(kind) => kind,
            Err(err) => {
                warn!(error = %err, "unrecognized request");
                return DispatchResponse::request_error();
            }
        };
        debug!(request_type = %kind, args = request.request_arguments.len(), "dispatching request");

        match self.route(kind, request) {
            Ok(response) => response,
            Err(err) => {
                warn!(request_type = %kind, error = %err, "request handler failed");
                DispatchResponse::request_error()
            }
        }
    }

    fn route(
        &self,
        kind: RequestType,
        request: &ClientRequest,
    ) -> Result<DispatchResponse, HandlerError> {
        let handlers = self.handlers.as_ref();
        match kind {
            RequestType::ValidateServerSignature => self.answer_challenge(request),
            RequestType::GetLaunchArguments => {
                let context = LaunchContext::from_request(request);
                handlers
                    .launch_arguments(&context)
                    .map(DispatchResponse::Text)
            }
            RequestType::DeRegisterWithPhomeServer => {
                handlers.deregister()?;
                Ok(DispatchResponse::Text(SUCCESS.to_string()))
            }
            RequestType::SaveProxy => {
                let proxy = request
                    .first_argument()
                    .ok_or_else(|| HandlerError::new("SaveProxy requires a proxy argument"))?;
                handlers.save_proxy(proxy)?;
                Ok(DispatchResponse::Text(SUCCESS.to_string()))
            }
            RequestType::GetInstallerInitialSettings => {
                let settings = handlers.installer_initial_settings()?;
                Ok(DispatchResponse::Structured(ClientRequest::response(vec![
                    Argument::new("UserProxy", settings.user_proxy),
                    Argument::new("privacySetting", settings.privacy_setting),
                ])))
            }
            RequestType::IsUiRunningAutoupdateCheck => {
                handlers.is_ui_running().map(|running| DispatchResponse::Text(bool_text(running)))
            }
            RequestType::MstDeployment => {
                let encoded = request
                    .first_argument()
                    .ok_or_else(|| HandlerError::new("MSTDeployement requires an argument"))?;
                handlers
                    .apply_mst_deployment(encoded)
                    .map(|applied| DispatchResponse::Text(bool_text(applied)))
            }
        }
    }

    fn answer_challenge(&self, request: &ClientRequest) -> Result<DispatchResponse, HandlerError> {
        let keys = self
            .keys
            .as_deref()
            .ok_or_else(|| HandlerError::new("no key source configured for challenges"))?;
        let encrypted = request
            .first_argument()
            .ok_or_else(|| HandlerError::new("challenge carries no nonce"))?;
        respond_to_challenge(keys, encrypted)
            .map(DispatchResponse::Bytes)
            .map_err(|err| HandlerError::new(err.to_string()))
    }
}
