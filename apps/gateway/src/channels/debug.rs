//! `extensionHostDebugBroadcast`: fan-out of debug messages between all
//! connected workbench windows. Nothing is persisted; late subscribers only
//! see messages sent after they attached.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::{ChannelError, EventStream, ServerChannel, SessionContext};

/// Capacity of the broadcast ring; slow receivers skip messages.
const BROADCAST_CAPACITY: usize = 256;

/// The global debug broadcast hub. Cloneable; store in AppState.
#[derive(Clone)]
pub struct DebugBroadcast {
    sender: broadcast::Sender<Arc<Value>>,
}

impl DebugBroadcast {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Value>> {
        self.sender.subscribe()
    }

    pub fn dispatch(&self, payload: Value) {
        // send() errors when there are no receivers, which is fine.
        let _ = self.sender.send(Arc::new(payload));
    }
}

impl Default for DebugBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ExtensionHostDebugChannel {
    hub: DebugBroadcast,
}

impl ExtensionHostDebugChannel {
    pub fn new(hub: DebugBroadcast) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl ServerChannel for ExtensionHostDebugChannel {
    async fn call(
        &self,
        _ctx: &SessionContext,
        command: &str,
        args: Value,
        _cancel: CancellationToken,
    ) -> Result<Value, ChannelError> {
        match command {
            "broadcast" => {
                self.hub.dispatch(args);
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
        cancel: CancellationToken,
    ) -> Result<EventStream, ChannelError> {
        if event != "broadcast" {
            return Err(ChannelError::UnknownEvent(event.to_string()));
        }
        let mut hub_rx = self.hub.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = hub_rx.recv() => match received {
                        Ok(payload) => {
                            if tx.send((*payload).clone()).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "debug broadcast subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_listener() {
        let hub = DebugBroadcast::new();
        let channel = ExtensionHostDebugChannel::new(hub.clone());
        let ctx = SessionContext::new("h".into(), "t".into());
        let mut stream = channel
            .listen(&ctx, "broadcast", Value::Null, CancellationToken::new())
            .unwrap();
        channel
            .call(
                &ctx,
                "broadcast",
                serde_json::json!({ "event": "attach", "port": 9229 }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let got = stream.recv().await.unwrap();
        assert_eq!(got["event"], "attach");
    }

    #[tokio::test]
    async fn cancelled_listener_stops() {
        let hub = DebugBroadcast::new();
        let channel = ExtensionHostDebugChannel::new(hub.clone());
        let ctx = SessionContext::new("h".into(), "t".into());
        let cancel = CancellationToken::new();
        let mut stream = channel
            .listen(&ctx, "broadcast", Value::Null, cancel.clone())
            .unwrap();
        cancel.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        hub.dispatch(serde_json::json!({ "late": true }));
        assert!(stream.recv().await.is_none());
    }
}
