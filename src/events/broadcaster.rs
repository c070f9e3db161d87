use serde_json::Value;
use tokio::sync::broadcast;

/// Broadcasts `{type, payload}` notification strings to all subscribers
/// (the host app in sidecar mode, the CLI, tests).
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Send a notification to all subscribers.
    pub fn broadcast(&self, event_type: &str, payload: Value) {
        let notification = serde_json::json!({
            "type": event_type,
            "payload": payload,
        });
        // Ignore errors — no subscribers is fine
        let _ = self
            .tx
            .send(serde_json::to_string(&notification).unwrap_or_default());
    }

    /// Subscribe to all broadcast notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}
