use std::sync::Arc;

use tracing::debug;
use trustpipe_channel::{
    ChannelConfig, ClientRequest, FixedStatus, PeerUidVerifier, PipeChannel, SignatureStatus,
    SignatureVerifier, StaticKeySource,
};

use crate::cmd::{parse_duration, Assume, SendArgs};
use crate::exit::{channel_error, CliResult, SUCCESS};
use crate::output::{print_reply, OutputFormat};

pub async fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let connect_timeout = parse_duration(&args.connect_timeout)?;
    let reply_timeout = parse_duration(&args.timeout)?;

    let config = ChannelConfig {
        connect_timeout,
        ..ChannelConfig::default()
    };
    let mut channel = PipeChannel::with_config(&args.name, config)
        .with_verifier(verifier_for(args.assume, args.expected_uid));
    if let Some(path) = &args.public_key {
        let keys = StaticKeySource::from_public_pem_file(path)
            .map_err(|err| channel_error("failed loading public key", err))?;
        channel = channel.with_key_source(Arc::new(keys));
    }

    channel
        .connect()
        .await
        .map_err(|err| channel_error("connect failed", err))?;
    let trust = channel.trust_state();
    debug!(name = %args.name, %trust, "sending request");

    let request = build_request(&args);
    let reply = channel.request(&request, reply_timeout).await;
    channel.close().await;
    let reply = reply.map_err(|err| channel_error("request failed", err))?;

    print_reply(&request.request_type, trust, &reply, format);
    Ok(SUCCESS)
}

fn verifier_for(assume: Assume, expected_uid: u32) -> Arc<dyn SignatureVerifier> {
    match assume {
        Assume::Check => Arc::new(PeerUidVerifier::new(expected_uid)),
        Assume::Valid => Arc::new(FixedStatus(SignatureStatus::Success)),
        Assume::Indeterminate => Arc::new(FixedStatus(SignatureStatus::AccessDenied)),
    }
}

fn build_request(args: &SendArgs) -> ClientRequest {
    args.args
        .iter()
        .fold(ClientRequest::new(&args.request_type), |request, (key, value)| {
            request.with_argument(key, value)
        })
}
