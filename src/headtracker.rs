//! New-head tracker
//!
//! Optional producer: subscribes to `newHeads` over the node's WebSocket
//! endpoint and publishes the latest block number into a shared slot the
//! poller reads when computing its scan window. Head notifications never
//! trigger submissions on their own.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::chain::abi;

/// Latest head number seen, shared between this producer and the poller.
/// The only lock in the agent.
pub type SharedHead = Arc<Mutex<Option<u64>>>;

pub fn shared_head() -> SharedHead {
    Arc::new(Mutex::new(None))
}

/// Wait before redialing a failed subscription.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct SubscriptionMessage {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<SubscriptionParams>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionParams {
    result: HeadPayload,
}

#[derive(Debug, Deserialize)]
struct HeadPayload {
    number: String,
}

pub struct HeadTracker {
    ws_url: String,
    shared_head: SharedHead,
}

impl HeadTracker {
    pub fn new(ws_url: String, shared_head: SharedHead) -> Self {
        Self {
            ws_url,
            shared_head,
        }
    }

    /// Redial loop; runs until shutdown flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(url = %self.ws_url, "head tracker started");
        loop {
            let stream_shutdown = shutdown.clone();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                result = self.subscribe_once(stream_shutdown) => {
                    match result {
                        Ok(()) => break, // shutdown observed inside the stream loop
                        Err(e) => {
                            warn!(error = %e, "head subscription dropped, redialing");
                            tokio::select! {
                                changed = shutdown.changed() => {
                                    if changed.is_err() || *shutdown.borrow() {
                                        break;
                                    }
                                }
                                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                            }
                        }
                    }
                }
            }
        }
        info!("head tracker stopped");
    }

    /// One subscription lifetime: connect, subscribe, consume heads until the
    /// stream errors or shutdown flips. `Ok(())` means clean shutdown.
    async fn subscribe_once(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (mut stream, _) = connect_async(self.ws_url.as_str())
            .await
            .context("failed to connect to the node websocket")?;

        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["newHeads"],
        });
        stream
            .send(Message::Text(request.to_string()))
            .await
            .context("failed to send newHeads subscription")?;

        info!("subscribed to new heads");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = stream.close(None).await;
                        return Ok(());
                    }
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => self.handle_message(&text),
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = stream.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            anyhow::bail!("websocket closed by the node");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e).context("websocket read failed"),
                    }
                }
            }
        }
    }

    fn handle_message(&self, text: &str) {
        let parsed: SubscriptionMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "unparseable websocket message");
                return;
            }
        };

        // The subscription ack and other replies have no params
        let Some(params) = parsed.params else {
            return;
        };
        if parsed.method.as_deref() != Some("eth_subscription") {
            return;
        }

        match abi::decode_quantity(&params.result.number) {
            Ok(number) => {
                debug!(head = number, "new head");
                *self.shared_head.lock() = Some(number);
            }
            Err(e) => debug!(error = %e, "bad head number in notification"),
        }
    }
}
