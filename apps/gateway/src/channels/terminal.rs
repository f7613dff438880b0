//! `remoteterminal`: environment queries only. The gateway answers what the
//! workbench needs to render terminal profiles; no PTYs are started here.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{ChannelError, EventStream, ServerChannel, SessionContext};

pub struct RemoteTerminalChannel;

#[async_trait]
impl ServerChannel for RemoteTerminalChannel {
    async fn call(
        &self,
        _ctx: &SessionContext,
        command: &str,
        _args: Value,
        _cancel: CancellationToken,
    ) -> Result<Value, ChannelError> {
        match command {
            "$getEnvironment" => {
                let env: BTreeMap<String, String> = std::env::vars().collect();
                Ok(serde_json::to_value(env)
                    .map_err(|e| ChannelError::Failed(e.to_string()))?)
            }
            "$getDefaultSystemShell" => Ok(Value::from(default_shell())),
            "$getProfiles" => Ok(Value::Array(Vec::new())),
            "$getTerminalLayoutInfo" => Ok(Value::Null),
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

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}
