use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, Result};

/// Request type: fallback trust challenge sent by the client.
pub const VALIDATE_SERVER_SIGNATURE: &str = "ValidateServerSignature";

/// A flat key/value pair carried in requests and responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Argument {
    #[serde(alias = "Key")]
    pub key: String,
    #[serde(alias = "Value")]
    pub value: String,
}

impl Argument {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Request envelope exchanged over the pipe as JSON.
///
/// Field names are camelCase on the wire; PascalCase is accepted on input
/// for peers that serialize .NET-style.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    #[serde(default, alias = "RequestType")]
    pub request_type: String,
    #[serde(default, alias = "RequestArguments", deserialize_with = "null_as_empty")]
    pub request_arguments: Vec<Argument>,
    #[serde(
        default,
        alias = "Response",
        skip_serializing_if = "Option::is_none"
    )]
    pub response: Option<Vec<Argument>>,
}

impl ClientRequest {
    /// Create a request with no arguments.
    pub fn new(request_type: impl Into<String>) -> Self {
        Self {
            request_type: request_type.into(),
            ..Self::default()
        }
    }

    /// Append an argument.
    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_arguments.push(Argument::new(key, value));
        self
    }

    /// A response-only envelope.
    pub fn response(arguments: Vec<Argument>) -> Self {
        Self {
            response: Some(arguments),
            ..Self::default()
        }
    }

    /// The fallback trust challenge carrying an encrypted nonce.
    pub fn challenge(encrypted_nonce: impl Into<String>) -> Self {
        Self::new(VALIDATE_SERVER_SIGNATURE).with_argument(VALIDATE_SERVER_SIGNATURE, encrypted_nonce)
    }

    /// Value of the first argument named `key`.
    pub fn argument(&self, key: &str) -> Option<&str> {
        self.request_arguments
            .iter()
            .find(|arg| arg.key == key)
            .map(|arg| arg.value.as_str())
    }

    /// Value of the first argument regardless of its key.
    pub fn first_argument(&self) -> Option<&str> {
        self.request_arguments.first().map(|arg| arg.value.as_str())
    }

    /// Decode a request from a frame payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|err| ChannelError::MalformedMessage(format!("payload is not UTF-8: {err}")))?;
        let text = text.trim_end_matches('\0');
        if text.trim().is_empty() {
            return Err(ChannelError::MalformedMessage("empty request".to_string()));
        }
        serde_json::from_str(text).map_err(|err| ChannelError::MalformedMessage(err.to_string()))
    }

    /// Encode this request as a frame payload.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<Argument>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Argument>>::deserialize(deserializer)?.unwrap_or_default())
}
