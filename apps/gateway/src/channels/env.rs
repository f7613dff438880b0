//! `remoteextensionsenvironment`: the environment record the workbench asks
//! for right after connecting, plus extension scanning entry points.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use workbench_common::id;

use crate::config::Config;
use crate::uri::UriComponents;

use super::extensions::ExtensionScanner;
use super::{ChannelError, EventStream, ServerChannel, SessionContext};

/// OS codes as the workbench encodes them.
fn os_code() -> u8 {
    match std::env::consts::OS {
        "windows" => 1,
        "macos" => 2,
        _ => 3,
    }
}

pub struct RemoteExtensionsEnvironmentChannel {
    config: Arc<Config>,
    scanner: Arc<ExtensionScanner>,
}

impl RemoteExtensionsEnvironmentChannel {
    pub fn new(config: Arc<Config>, scanner: Arc<ExtensionScanner>) -> Self {
        Self { config, scanner }
    }

    fn remote_uri(&self, ctx: &SessionContext, path: &std::path::Path) -> UriComponents {
        ctx.transformer
            .transform_outgoing(&UriComponents::file(path.to_string_lossy()))
    }

    fn environment_data(&self, ctx: &SessionContext) -> Value {
        let user_data = &self.config.user_data_dir;
        serde_json::json!({
            "pid": std::process::id(),
            "connectionToken": id::prefixed_ulid(id::prefix::CONNECTION),
            "appRoot": self.remote_uri(ctx, &self.config.app_root),
            "settingsPath": self.remote_uri(ctx, &user_data.join("Machine").join("settings.json")),
            "logsPath": self.remote_uri(ctx, &user_data.join("logs")),
            "extensionsPath": self.remote_uri(ctx, &self.config.user_extensions_dir),
            "globalStorageHome": self.remote_uri(ctx, &user_data.join("globalStorage")),
            "workspaceStorageHome": self.remote_uri(ctx, &user_data.join("workspaceStorage")),
            "userHome": self.remote_uri(ctx, std::path::Path::new(
                &std::env::var("HOME").unwrap_or_else(|_| "/".to_string()),
            )),
            "os": os_code(),
            "arch": std::env::consts::ARCH,
            "marks": [],
            "useHostProxy": false,
        })
    }
}

#[async_trait]
impl ServerChannel for RemoteExtensionsEnvironmentChannel {
    async fn call(
        &self,
        ctx: &SessionContext,
        command: &str,
        args: Value,
        _cancel: CancellationToken,
    ) -> Result<Value, ChannelError> {
        match command {
            "getEnvironmentData" => Ok(self.environment_data(ctx)),
            "scanExtensions" => {
                let wire: Vec<Value> = self
                    .scanner
                    .scan_all()
                    .await
                    .iter()
                    .map(|e| e.to_wire(ctx))
                    .collect();
                Ok(Value::Array(wire))
            }
            "scanSingleExtension" => {
                let location: UriComponents = serde_json::from_value(
                    args.get("extensionLocation").cloned().unwrap_or(Value::Null),
                )
                .map_err(|e| ChannelError::BadArgs(e.to_string()))?;
                let is_builtin = args
                    .get("isBuiltin")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let path = ctx.transformer.transform_incoming(&location).path;
                let scanned =
                    ExtensionScanner::scan_one(std::path::Path::new(&path), is_builtin).await?;
                Ok(scanned.to_wire(ctx))
            }
            other => Err(ChannelError::UnknownCommand(other.to_string())),
        }
    }

    fn listen(
        &self,
        _ctx: &SessionContext,
        event: &str,
        _args: Value,
        _cancel: CancellationToken,
    ) -> Result<EventStream, ChannelError> {
        Err(ChannelError::UnknownEvent(event.to_string()))
    }
}
