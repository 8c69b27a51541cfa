use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use trustpipe_channel::{
    Dispatcher, HandlerError, InstallerSettings, LaunchContext, PipeServer, ServerConfig,
    ServiceHandlers, StaticKeySource,
};

use crate::cmd::ServeArgs;
use crate::exit::{channel_error, io_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};

/// Handler answers loaded from a JSON file.
///
/// Every field is optional; missing ones fall back to the defaults below.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CannedResponses {
    pub launch_arguments: serde_json::Value,
    pub user_proxy: String,
    pub privacy_setting: String,
    pub ui_running: bool,
    pub mst_deployment: bool,
}

impl Default for CannedResponses {
    fn default() -> Self {
        Self {
            launch_arguments: serde_json::json!({
                "Language": "en-US",
                "VersionMismatch": "False",
                "PrivacySetting": "True",
            }),
            user_proxy: String::new(),
            privacy_setting: "True".to_string(),
            ui_running: false,
            mst_deployment: true,
        }
    }
}

impl CannedResponses {
    pub fn load(path: &Path) -> CliResult<Self> {
        let raw = std::fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
        serde_json::from_slice(&raw).map_err(|err| {
            CliError::new(
                DATA_INVALID,
                format!("invalid responses file {}: {err}", path.display()),
            )
        })
    }
}

impl ServiceHandlers for CannedResponses {
    fn launch_arguments(&self, context: &LaunchContext) -> Result<String, HandlerError> {
        info!(
            client_source = %context.client_source,
            appx_version = ?context.current_appx_version,
            wss_restart = context.wss_restart,
            "launch arguments requested"
        );
        let mut document = self.launch_arguments.clone();
        if let Some(object) = document.as_object_mut() {
            object.insert(
                "ClientSource".to_string(),
                serde_json::Value::String(context.client_source.clone()),
            );
        }
        serde_json::to_string(&document).map_err(|err| HandlerError::new(err.to_string()))
    }

    fn deregister(&self) -> Result<(), HandlerError> {
        info!("deregistration requested");
        Ok(())
    }

    fn save_proxy(&self, proxy: &str) -> Result<(), HandlerError> {
        serde_json::from_str::<serde_json::Value>(proxy)
            .map_err(|err| HandlerError::new(format!("proxy is not JSON: {err}")))?;
        info!(size = proxy.len(), "proxy settings received");
        Ok(())
    }

    fn installer_initial_settings(&self) -> Result<InstallerSettings, HandlerError> {
        Ok(InstallerSettings {
            user_proxy: self.user_proxy.clone(),
            privacy_setting: self.privacy_setting.clone(),
        })
    }

    fn is_ui_running(&self) -> Result<bool, HandlerError> {
        Ok(self.ui_running)
    }

    fn apply_mst_deployment(&self, encoded: &str) -> Result<bool, HandlerError> {
        info!(size = encoded.len(), "deployment configuration received");
        Ok(self.mst_deployment)
    }
}

pub async fn run(args: ServeArgs) -> CliResult<i32> {
    let responses = match &args.responses {
        Some(path) => CannedResponses::load(path)?,
        None => CannedResponses::default(),
    };

    let mut dispatcher = Dispatcher::new(Arc::new(responses));
    match &args.private_key {
        Some(path) => {
            let keys = StaticKeySource::from_private_pem_file(path)
                .map_err(|err| channel_error("failed loading private key", err))?;
            dispatcher = dispatcher.with_key_source(Arc::new(keys));
        }
        None => warn!("no private key configured; trust challenges will be refused"),
    }

    let config = ServerConfig {
        socket_mode: parse_mode(args.socket_mode.as_deref())?,
        ..ServerConfig::default()
    };
    let server = PipeServer::with_config(&args.name, config)
        .map_err(|err| channel_error("bind failed", err))?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
        }
        on_signal.cancel();
    });

    server
        .serve(dispatcher, shutdown)
        .await
        .map_err(|err| channel_error("serve failed", err))?;
    Ok(SUCCESS)
}

fn parse_mode(input: Option<&str>) -> CliResult<Option<u32>> {
    let Some(input) = input else {
        return Ok(None);
    };
    let digits = input.trim_start_matches("0o");
    let mode = u32::from_str_radix(digits, 8)
        .map_err(|_| CliError::new(USAGE, format!("invalid octal socket mode: {input}")))?;
    if mode > 0o777 {
        return Err(CliError::new(USAGE, format!("socket mode out of range: {input}")));
    }
    Ok(Some(mode))
}
