use std::sync::Arc;

use crate::channel::{ChannelConfig, PipeChannel};
use crate::error::Result;
use crate::keys::KeySource;
use crate::signature::SignatureVerifier;

/// Connect to a service pipe with default settings and establish trust.
pub async fn connect(name: &str) -> Result<PipeChannel> {
    connect_with_config(name, ChannelConfig::default(), None, None).await
}

/// Connect with explicit configuration and trust collaborators.
///
/// `verifier` replaces the default peer check; `keys` enables the challenge
/// fallback when that check is indeterminate.
pub async fn connect_with_config(
    name: &str,
    config: ChannelConfig,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    keys: Option<Arc<dyn KeySource>>,
) -> Result<PipeChannel> {
    let mut channel = PipeChannel::with_config(name, config);
    if let Some(verifier) = verifier {
        channel = channel.with_verifier(verifier);
    }
    if let Some(keys) = keys {
        channel = channel.with_key_source(keys);
    }
    channel.connect().await?;
    Ok(channel)
}
