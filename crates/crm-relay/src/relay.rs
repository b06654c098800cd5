//! Main relay loop: stream messages in, engine entries out.

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::redis_consumer::{RedisConsumer, StreamAcknowledger, StreamMessage};
use batch_delivery_engine::{AckHandle, Acknowledger, BatchDeliveryEngine, DeliveryError};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Acknowledger that can record why its message was dead-lettered.
pub trait DeadLetterReason: Acknowledger + Sized + 'static {
    fn with_reason(self, reason: String) -> Self;
}

impl DeadLetterReason for StreamAcknowledger {
    fn with_reason(self, reason: String) -> Self {
        StreamAcknowledger::with_reason(self, reason)
    }
}

/// Where a dispatched message went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Handed to the engine for delivery.
    Buffered,
    /// Undecodable; rejected straight to dead-letter.
    DeadLettered { reason: String },
}

/// Decode a message payload as a JSON CRM event.
pub fn decode_payload(message: &StreamMessage) -> Result<Value, String> {
    let raw = message
        .payload
        .as_deref()
        .ok_or_else(|| "message has no payload field".to_string())?;
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON payload: {}", e))
}

/// Route one stream message: decodable payloads go to the engine,
/// everything else is dead-lettered without a delivery attempt.
pub async fn dispatch<A>(
    engine: &BatchDeliveryEngine<Value>,
    message: &StreamMessage,
    acknowledger: A,
) -> RelayResult<Dispatched>
where
    A: DeadLetterReason,
{
    match decode_payload(message) {
        Ok(event) => {
            let ack = AckHandle::new(message.message_id.clone(), acknowledger);
            engine.add(event, ack).await?;
            Ok(Dispatched::Buffered)
        }
        Err(reason) => {
            warn!(
                message_id = %message.message_id,
                reason = %reason,
                "Undecodable message, dead-lettering without delivery"
            );
            let ack = AckHandle::new(
                message.message_id.clone(),
                acknowledger.with_reason(reason.clone()),
            );
            ack.reject().await?;
            Ok(Dispatched::DeadLettered { reason })
        }
    }
}

/// The CRM relay.
///
/// Orchestrates the flow of events from Redis to the delivery engine.
pub struct Relay {
    config: RelayConfig,
    redis: RedisConsumer,
    engine: Arc<BatchDeliveryEngine<Value>>,
}

impl Relay {
    /// Connect to Redis and wrap an already started engine.
    pub async fn new(config: RelayConfig, engine: Arc<BatchDeliveryEngine<Value>>) -> RelayResult<Self> {
        let redis = RedisConsumer::connect(config.clone()).await?;
        Ok(Self::with_consumer(config, redis, engine))
    }

    /// Wrap an existing consumer and an already started engine.
    pub fn with_consumer(
        config: RelayConfig,
        redis: RedisConsumer,
        engine: Arc<BatchDeliveryEngine<Value>>,
    ) -> Self {
        Self {
            config,
            redis,
            engine,
        }
    }

    /// Run the consume loop until `shutdown` resolves.
    ///
    /// A batch already read when shutdown fires is dispatched in full before
    /// returning, so no read message is left without an ack handle.
    pub async fn run<F>(&mut self, shutdown: F) -> RelayResult<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            stream = %self.config.stream,
            group = %self.config.consumer_group,
            consumer = %self.config.consumer_name,
            "Starting CRM relay loop"
        );

        tokio::pin!(shutdown);
        loop {
            let read = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, leaving consume loop");
                    return Ok(());
                }
                read = self.redis.read_batch() => read,
            };

            match read {
                Ok(messages) => {
                    if messages.is_empty() {
                        debug!("No messages available, continuing to poll...");
                        continue;
                    }
                    self.dispatch_all(messages).await?;
                }
                Err(e) => {
                    error!(error = %e, "Error reading from stream");
                    self.recover(&e).await;
                }
            }
        }
    }

    async fn dispatch_all(&self, messages: Vec<StreamMessage>) -> RelayResult<()> {
        for message in messages {
            let acknowledger = self.redis.acknowledger_for(&message);
            match dispatch(&self.engine, &message, acknowledger).await {
                Ok(Dispatched::Buffered) => {
                    debug!(message_id = %message.message_id, "Message buffered");
                }
                Ok(Dispatched::DeadLettered { .. }) => {}
                Err(RelayError::Delivery(DeliveryError::Stopped)) => {
                    return Err(RelayError::Delivery(DeliveryError::Stopped));
                }
                Err(e) => {
                    // Still pending; a later XAUTOCLAIM sweep reads it again.
                    error!(
                        message_id = %message.message_id,
                        error = %e,
                        "Failed to dispatch message"
                    );
                }
            }
        }
        Ok(())
    }

    async fn recover(&mut self, error: &RelayError) {
        match error {
            RelayError::Redis(_) => {
                warn!("Redis error, attempting to reconnect...");
                tokio::time::sleep(Duration::from_secs(1)).await;
                if let Err(reconnect_err) = self.redis.reconnect().await {
                    error!(error = %reconnect_err, "Failed to reconnect to Redis");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
            _ => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batch_delivery_engine::testing::{
        AckEvent, RecordedOrigin, RecordingAcknowledger, RecordingSink,
    };
    use batch_delivery_engine::BatchConfig;
    use serde_json::json;

    impl DeadLetterReason for RecordedOrigin {
        fn with_reason(self, _reason: String) -> Self {
            self
        }
    }

    fn message(id: &str, payload: Option<&str>) -> StreamMessage {
        StreamMessage {
            message_id: id.to_string(),
            payload: payload.map(str::to_string),
        }
    }

    fn engine(sink: Arc<RecordingSink<Value>>) -> BatchDeliveryEngine<Value> {
        let config = BatchConfig {
            max_batch_size: 2,
            ..BatchConfig::default()
        };
        BatchDeliveryEngine::new(config, sink).unwrap()
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(
            decode_payload(&message("1-0", Some(r#"{"email":"a@example.com"}"#))),
            Ok(json!({"email": "a@example.com"}))
        );
        assert!(decode_payload(&message("2-0", Some("not json")))
            .unwrap_err()
            .starts_with("invalid JSON payload"));
        assert_eq!(
            decode_payload(&message("3-0", None)),
            Err("message has no payload field".to_string())
        );
    }

    #[tokio::test]
    async fn test_dispatch_buffers_decoded_events() {
        let sink = Arc::new(RecordingSink::succeeding());
        let engine = engine(sink.clone());
        let acks = RecordingAcknowledger::new();

        for (id, email) in [("1-0", "a"), ("2-0", "b")] {
            let payload = format!(r#"{{"email":"{}"}}"#, email);
            let outcome = dispatch(&engine, &message(id, Some(&payload)), acks.handle_for(id))
                .await
                .unwrap();
            assert_eq!(outcome, Dispatched::Buffered);
        }

        assert_eq!(sink.delivered(), vec![json!({"email": "a"}), json!({"email": "b"})]);
        assert_eq!(acks.confirmed(), vec!["1-0", "2-0"]);
    }

    #[tokio::test]
    async fn test_dispatch_dead_letters_undecodable_payload() {
        let sink = Arc::new(RecordingSink::succeeding());
        let engine = engine(sink.clone());
        let acks = RecordingAcknowledger::new();

        let outcome = dispatch(&engine, &message("1-0", Some("{broken")), acks.handle_for("1-0"))
            .await
            .unwrap();

        assert!(matches!(outcome, Dispatched::DeadLettered { .. }));
        assert_eq!(acks.events(), vec![AckEvent::Rejected("1-0".to_string())]);
        assert_eq!(sink.call_count(), 0);
        assert_eq!(engine.stats().buffered, 0);
    }

    #[tokio::test]
    async fn test_dispatch_to_stopped_engine_fails() {
        let sink = Arc::new(RecordingSink::succeeding());
        let engine = engine(sink);
        engine.stop().await.unwrap();
        let acks = RecordingAcknowledger::new();

        let err = dispatch(&engine, &message("1-0", Some("{}")), acks.handle_for("1-0"))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Delivery(DeliveryError::Stopped)));
        assert!(acks.events().is_empty());
    }
}
