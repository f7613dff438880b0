//! `logLevel` and `logger` channels: the workbench drives the process log
//! level and forwards client-side log entries into the gateway's sink.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{ChannelError, EventStream, ServerChannel, SessionContext};

/// Numeric log levels as the workbench encodes them.
pub const LEVEL_TRACE: u8 = 0;
pub const LEVEL_DEBUG: u8 = 1;
pub const LEVEL_INFO: u8 = 2;
pub const LEVEL_WARN: u8 = 3;
pub const LEVEL_ERROR: u8 = 4;

/// Process-wide log level shared by the channels and the supervisor env.
pub struct LogLevelHandle {
    level: AtomicU8,
}

impl LogLevelHandle {
    pub fn new(level: u8) -> Arc<Self> {
        Arc::new(Self {
            level: AtomicU8::new(level),
        })
    }

    pub fn get(&self) -> u8 {
        self.level.load(Ordering::Relaxed)
    }

    pub fn set(&self, level: u8) {
        self.level.store(level, Ordering::Relaxed);
    }

    /// The textual form forked workers receive via `VSCODE_LOG_LEVEL`.
    pub fn as_str(&self) -> &'static str {
        match self.get() {
            LEVEL_TRACE => "trace",
            LEVEL_DEBUG => "debug",
            LEVEL_INFO => "info",
            LEVEL_WARN => "warn",
            _ => "error",
        }
    }

    pub fn parse(level: &str) -> u8 {
        match level {
            "trace" => LEVEL_TRACE,
            "debug" => LEVEL_DEBUG,
            "warn" => LEVEL_WARN,
            "error" | "critical" => LEVEL_ERROR,
            _ => LEVEL_INFO,
        }
    }
}

/// `logLevel` channel.
pub struct LogLevelChannel {
    handle: Arc<LogLevelHandle>,
}

impl LogLevelChannel {
    pub fn new(handle: Arc<LogLevelHandle>) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl ServerChannel for LogLevelChannel {
    async fn call(
        &self,
        _ctx: &SessionContext,
        command: &str,
        args: Value,
        _cancel: CancellationToken,
    ) -> Result<Value, ChannelError> {
        match command {
            "getLevel" => Ok(Value::from(self.handle.get())),
            "setLevel" => {
                let level = args
                    .get("level")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| ChannelError::BadArgs("missing `level`".into()))?;
                self.handle.set(level.min(LEVEL_ERROR as u64) as u8);
                tracing::info!(level, "log level changed by client");
                Ok(Value::Null)
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

/// `logger` channel: client log entries land in the gateway's sink with the
/// session token prefix.
pub struct LoggerChannel;

#[async_trait]
impl ServerChannel for LoggerChannel {
    async fn call(
        &self,
        ctx: &SessionContext,
        command: &str,
        args: Value,
        _cancel: CancellationToken,
    ) -> Result<Value, ChannelError> {
        match command {
            "log" => {
                let level = args.get("level").and_then(Value::as_u64).unwrap_or(2) as u8;
                let message = args
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let prefix: String = ctx.token.chars().take(8).collect();
                match level {
                    LEVEL_TRACE | LEVEL_DEBUG => tracing::debug!(%prefix, "{message}"),
                    LEVEL_WARN => tracing::warn!(%prefix, "{message}"),
                    LEVEL_ERROR => tracing::error!(%prefix, "{message}"),
                    _ => tracing::info!(%prefix, "{message}"),
                }
                Ok(Value::Null)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_and_get_level() {
        let handle = LogLevelHandle::new(LEVEL_INFO);
        let channel = LogLevelChannel::new(handle.clone());
        let ctx = SessionContext::new("h".into(), "t".into());
        let got = channel
            .call(&ctx, "getLevel", Value::Null, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(got, Value::from(LEVEL_INFO));
        channel
            .call(
                &ctx,
                "setLevel",
                serde_json::json!({ "level": 0 }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(handle.get(), LEVEL_TRACE);
        assert_eq!(handle.as_str(), "trace");
    }

    #[test]
    fn parse_level_names() {
        assert_eq!(LogLevelHandle::parse("trace"), LEVEL_TRACE);
        assert_eq!(LogLevelHandle::parse("warn"), LEVEL_WARN);
        assert_eq!(LogLevelHandle::parse("weird"), LEVEL_INFO);
    }
}
