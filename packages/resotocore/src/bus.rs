use std::sync::Arc;

use dashmap::DashMap;
use resotocore_types::{BusMessage, MessageType};
use tokio::sync::mpsc;
use tracing::instrument;

const CHANNEL_CAPACITY: usize = 256;

/// A bounded, per-subscriber receive end. Dropping it detaches the
/// subscriber from the bus, guaranteed on every exit path (panic, early
/// return, or normal completion of whatever holds it).
pub struct BusSubscription {
    channel_id: String,
    message_types: Vec<MessageType>,
    receiver: mpsc::Receiver<BusMessage>,
    bus: MessageBus,
}

impl BusSubscription {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn message_types(&self) -> &[MessageType] {
        &self.message_types
    }

    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.bus.detach(&self.channel_id);
    }
}

/// In-process pub/sub keyed by channel id (one channel per subscriber).
/// Producers never block on a slow consumer: `emit` is best-effort and logs
/// a drop rather than applying backpressure. FIFO is preserved per producer
/// per subscriber because each subscriber owns exactly one bounded queue.
#[derive(Clone, Default)]
pub struct MessageBus {
    subscribers: Arc<DashMap<String, mpsc::Sender<BusMessage>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip(self), fields(subsys = "MessageBus"))]
    pub fn subscribe(
        &self,
        channel_id: impl Into<String> + std::fmt::Debug,
        message_types: Vec<MessageType>,
    ) -> BusSubscription {
        let channel_id = channel_id.into();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers.insert(channel_id.clone(), tx);
        BusSubscription {
            channel_id,
            message_types,
            receiver: rx,
            bus: self.clone(),
        }
    }

    fn detach(&self, channel_id: &str) {
        self.subscribers.remove(channel_id);
    }

    #[instrument(skip(self, message), fields(subsys = "MessageBus"))]
    pub fn emit(&self, channel_id: &str, message: BusMessage) {
        let Some(sender) = self.subscribers.get(channel_id) else {
            tracing::debug!("no subscriber for channel {channel_id}, dropping message");
            return;
        };
        if let Err(err) = sender.try_send(message) {
            tracing::warn!("channel {channel_id} full or closed, dropping message: {err}");
        }
    }

    pub fn emit_event(&self, channel_id: &str, event_type: impl Into<String>, payload: serde_json::Value) {
        self.emit(
            channel_id,
            BusMessage::Event {
                event_type: event_type.into(),
                payload,
            },
        );
    }

    /// Deterministic fan-out: callers pass subscriber ids already ordered
    /// (lexicographically, per the Subscription Registry's contract).
    pub fn fan_out<'a>(&self, channel_ids: impl IntoIterator<Item = &'a str>, message: BusMessage) {
        for channel_id in channel_ids {
            self.emit(channel_id, message.clone());
        }
    }

    pub fn is_subscribed(&self, channel_id: &str) -> bool {
        self.subscribers.contains_key(channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_receive_and_detach() {
        let bus = MessageBus::new();
        let mut sub = bus.subscribe("sub_1", vec![]);
        assert!(bus.is_subscribed("sub_1"));

        bus.emit_event("sub_1", "ping", serde_json::json!({"n": 1}));
        let msg = sub.recv().await.unwrap();
        assert!(matches!(msg, BusMessage::Event { event_type, .. } if event_type == "ping"));

        drop(sub);
        assert!(!bus.is_subscribed("sub_1"));
    }

    #[tokio::test]
    async fn emit_to_unknown_channel_is_a_noop() {
        let bus = MessageBus::new();
        // must not panic
        bus.emit_event("ghost", "ping", serde_json::Value::Null);
    }

    #[tokio::test]
    async fn fan_out_preserves_fifo_per_subscriber() {
        let bus = MessageBus::new();
        let mut sub = bus.subscribe("sub_1", vec![]);
        bus.emit_event("sub_1", "first", serde_json::Value::Null);
        bus.emit_event("sub_1", "second", serde_json::Value::Null);

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert!(matches!(first, BusMessage::Event { event_type, .. } if event_type == "first"));
        assert!(matches!(second, BusMessage::Event { event_type, .. } if event_type == "second"));
    }
}
