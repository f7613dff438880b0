//! Named-channel RPC served over management connections.
//!
//! Regular protocol messages on a management session carry JSON frames:
//! requests `{type, id, channel, name, args}` where `type` is one of
//! `promise`, `eventListen`, `eventDispose`, `cancel`; responses
//! `{type: "replyOk" | "replyErr" | "event", id, data}`. Promise calls are
//! answered in arrival order; event listens spawn forwarder tasks whose only
//! cancel trigger is the last listener going away (`eventDispose`).

pub mod debug;
pub mod env;
pub mod extensions;
pub mod fs;
pub mod logger;
pub mod terminal;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::uri::UriTransformer;

/// Per-session context handed to every channel invocation.
#[derive(Clone)]
pub struct SessionContext {
    /// The authority the client connected through; drives URI rewriting.
    pub remote_authority: String,
    /// Reconnection token of the session (used to key per-session state).
    pub token: String,
    pub transformer: Arc<UriTransformer>,
}

impl SessionContext {
    pub fn new(remote_authority: String, token: String) -> Self {
        let transformer = Arc::new(UriTransformer::new(remote_authority.clone()));
        Self {
            remote_authority,
            token,
            transformer,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("invalid arguments: {0}")]
    BadArgs(String),
    #[error("{0}")]
    Failed(String),
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Failed(err.to_string())
    }
}

/// Event payload stream produced by `listen`.
pub type EventStream = mpsc::UnboundedReceiver<Value>;

/// A named server channel: request/response calls plus event streams.
#[async_trait]
pub trait ServerChannel: Send + Sync {
    async fn call(
        &self,
        ctx: &SessionContext,
        command: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<Value, ChannelError>;

    fn listen(
        &self,
        ctx: &SessionContext,
        event: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<EventStream, ChannelError>;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RpcRequest {
    #[serde(rename = "promise")]
    Promise {
        id: u64,
        channel: String,
        name: String,
        #[serde(default)]
        args: Value,
    },
    #[serde(rename = "eventListen")]
    EventListen {
        id: u64,
        channel: String,
        name: String,
        #[serde(default)]
        args: Value,
    },
    #[serde(rename = "eventDispose")]
    EventDispose { id: u64 },
    #[serde(rename = "cancel")]
    Cancel { id: u64 },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum RpcResponse {
    #[serde(rename = "replyOk")]
    ReplyOk { id: u64, data: Value },
    #[serde(rename = "replyErr")]
    ReplyErr { id: u64, data: Value },
    #[serde(rename = "event")]
    Event { id: u64, data: Value },
}

impl RpcResponse {
    fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Routes RPC frames of one management session to its channels.
pub struct RpcDispatcher {
    ctx: SessionContext,
    channels: HashMap<&'static str, Arc<dyn ServerChannel>>,
    listens: HashMap<u64, CancellationToken>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
}

impl RpcDispatcher {
    pub fn new(ctx: SessionContext, outbound_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            ctx,
            channels: HashMap::new(),
            listens: HashMap::new(),
            outbound_tx,
        }
    }

    pub fn register(&mut self, name: &'static str, channel: Arc<dyn ServerChannel>) {
        self.channels.insert(name, channel);
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Handle one incoming RPC frame; returns serialized immediate replies.
    pub async fn handle_frame(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        let request: RpcRequest = match serde_json::from_slice(frame) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(%err, "dropping unparseable rpc frame");
                return Vec::new();
            }
        };

        match request {
            RpcRequest::Promise {
                id,
                channel,
                name,
                args,
            } => {
                let reply = match self.channels.get(channel.as_str()) {
                    Some(target) => {
                        let cancel = CancellationToken::new();
                        match target.call(&self.ctx, &name, args, cancel).await {
                            Ok(data) => RpcResponse::ReplyOk { id, data },
                            Err(err) => RpcResponse::ReplyErr {
                                id,
                                data: serde_json::json!({ "message": err.to_string() }),
                            },
                        }
                    }
                    None => RpcResponse::ReplyErr {
                        id,
                        data: serde_json::json!({ "message": format!("unknown channel `{channel}`") }),
                    },
                };
                vec![reply.to_bytes()]
            }
            RpcRequest::EventListen {
                id,
                channel,
                name,
                args,
            } => {
                let Some(target) = self.channels.get(channel.as_str()) else {
                    return vec![RpcResponse::ReplyErr {
                        id,
                        data: serde_json::json!({ "message": format!("unknown channel `{channel}`") }),
                    }
                    .to_bytes()];
                };
                let cancel = CancellationToken::new();
                match target.listen(&self.ctx, &name, args, cancel.clone()) {
                    Ok(mut stream) => {
                        self.listens.insert(id, cancel.clone());
                        let outbound = self.outbound_tx.clone();
                        tokio::spawn(async move {
                            loop {
                                tokio::select! {
                                    _ = cancel.cancelled() => break,
                                    payload = stream.recv() => match payload {
                                        Some(data) => {
                                            let event = RpcResponse::Event { id, data };
                                            if outbound.send(event.to_bytes()).await.is_err() {
                                                break;
                                            }
                                        }
                                        None => break,
                                    },
                                }
                            }
                        });
                        Vec::new()
                    }
                    Err(err) => vec![RpcResponse::ReplyErr {
                        id,
                        data: serde_json::json!({ "message": err.to_string() }),
                    }
                    .to_bytes()],
                }
            }
            RpcRequest::EventDispose { id } => {
                // The last listener went away: this is the only cancel
                // trigger a listen stream gets.
                if let Some(cancel) = self.listens.remove(&id) {
                    cancel.cancel();
                }
                Vec::new()
            }
            RpcRequest::Cancel { id } => {
                tracing::debug!(id, "cancel for inline call ignored");
                Vec::new()
            }
        }
    }

    /// Cancel every live listen; called when the session is disposed.
    pub fn dispose(&mut self) {
        for (_, cancel) in self.listens.drain() {
            cancel.cancel();
        }
    }
}

impl Drop for RpcDispatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}
