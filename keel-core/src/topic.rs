//! Topic registry: maps persisted topic tags to event body codecs.
//!
//! Every event inside a commit is stored as `{"topic", "headers", "body"}`.
//! The registry decides which topics may be written and how a stored body is
//! checked when commits are read back. Renamed topics stay readable through
//! aliases.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::CodecError;
use crate::event::{DomainEvent, EventMessage, Headers};

const TOPIC_FIELD: &str = "topic";
const HEADERS_FIELD: &str = "headers";
const BODY_FIELD: &str = "body";

type BodyCheck = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Registry of known event topics.
#[derive(Clone, Default)]
pub struct TopicRegistry {
    topics: HashMap<String, BodyCheck>,
    aliases: HashMap<String, String>,
}

impl fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut topics: Vec<&String> = self.topics.keys().collect();
        topics.sort();
        f.debug_struct("TopicRegistry")
            .field("topics", &topics)
            .field("aliases", &self.aliases)
            .finish()
    }
}

impl TopicRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed domain event. Stored bodies under `E::TOPIC` must
    /// deserialize into `E`.
    pub fn register<E: DomainEvent + 'static>(&mut self) -> &mut Self {
        let check: BodyCheck = Arc::new(|body: &Value| {
            serde_json::from_value::<E>(body.clone())
                .map(|_| ())
                .map_err(|e| e.to_string())
        });
        self.topics.insert(E::TOPIC.to_string(), check);
        self
    }

    /// Register a topic whose body is accepted as-is.
    pub fn register_opaque(&mut self, topic: impl Into<String>) -> &mut Self {
        let check: BodyCheck = Arc::new(|_: &Value| Ok(()));
        self.topics.insert(topic.into(), check);
        self
    }

    /// Read events stored under `old` as if they were written under `new`.
    pub fn alias(&mut self, old: impl Into<String>, new: impl Into<String>) -> &mut Self {
        self.aliases.insert(old.into(), new.into());
        self
    }

    /// Resolve a topic through aliases to a registered topic.
    pub fn resolve<'a>(&'a self, topic: &'a str) -> Option<&'a str> {
        let canonical = self.aliases.get(topic).map(String::as_str).unwrap_or(topic);
        self.topics
            .get_key_value(canonical)
            .map(|(key, _)| key.as_str())
    }

    /// Whether a topic (or an alias of one) is registered.
    pub fn contains(&self, topic: &str) -> bool {
        self.resolve(topic).is_some()
    }

    /// Number of registered topics, aliases excluded.
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Whether no topic is registered.
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Encode a message into its persisted JSON form.
    pub fn encode(&self, message: &EventMessage) -> Result<Value, CodecError> {
        if !self.topics.contains_key(&message.topic) {
            return Err(CodecError::UnknownTopic {
                topic: message.topic.clone(),
            });
        }
        let headers = serde_json::to_value(&message.headers).map_err(|e| {
            CodecError::Serialization {
                reason: e.to_string(),
            }
        })?;

        let mut encoded = Map::new();
        encoded.insert(TOPIC_FIELD.to_string(), Value::String(message.topic.clone()));
        encoded.insert(HEADERS_FIELD.to_string(), headers);
        encoded.insert(BODY_FIELD.to_string(), message.body.clone());
        Ok(Value::Object(encoded))
    }

    /// Decode a persisted JSON event back into a message.
    pub fn decode(&self, encoded: &Value) -> Result<EventMessage, CodecError> {
        let object = encoded.as_object().ok_or_else(|| CodecError::Malformed {
            reason: "encoded event is not an object".to_string(),
        })?;
        let stored_topic = object
            .get(TOPIC_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| CodecError::Malformed {
                reason: "encoded event has no topic".to_string(),
            })?;

        let topic = self
            .resolve(stored_topic)
            .ok_or_else(|| CodecError::UnknownTopic {
                topic: stored_topic.to_string(),
            })?;
        let body = object.get(BODY_FIELD).cloned().unwrap_or(Value::Null);
        if let Some(check) = self.topics.get(topic) {
            check(&body).map_err(|reason| CodecError::InvalidBody {
                topic: topic.to_string(),
                reason,
            })?;
        }

        let headers: Headers = match object.get(HEADERS_FIELD) {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                CodecError::Malformed {
                    reason: format!("event headers: {}", e),
                }
            })?,
            None => Headers::new(),
        };

        Ok(EventMessage {
            topic: topic.to_string(),
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
        total_cents: u64,
    }

    impl DomainEvent for OrderPlaced {
        const TOPIC: &'static str = "order.placed";
    }

    fn registry() -> TopicRegistry {
        let mut topics = TopicRegistry::new();
        topics.register::<OrderPlaced>().register_opaque("audit.note");
        topics
    }

    #[test]
    fn test_encode_decode_preserves_message() {
        let topics = registry();
        let message = EventMessage::from_event(&OrderPlaced {
            order_id: "o-1".to_string(),
            total_cents: 1250,
        })
        .unwrap()
        .with_header("actor", "alice");

        let encoded = topics.encode(&message).unwrap();
        assert_eq!(encoded["topic"], json!("order.placed"));
        assert_eq!(topics.decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_encode_rejects_unregistered_topic() {
        let topics = registry();
        let err = topics
            .encode(&EventMessage::new("order.cancelled", json!({})))
            .unwrap_err();
        assert_eq!(
            err,
            CodecError::UnknownTopic {
                topic: "order.cancelled".to_string()
            }
        );
    }

    #[test]
    fn test_decode_rejects_body_of_wrong_shape() {
        let topics = registry();
        let stored = json!({"topic": "order.placed", "headers": {}, "body": {"order_id": 7}});
        let err = topics.decode(&stored).unwrap_err();
        assert!(matches!(err, CodecError::InvalidBody { ref topic, .. } if topic == "order.placed"));
    }

    #[test]
    fn test_decode_unknown_topic() {
        let topics = registry();
        let stored = json!({"topic": "legacy.thing", "body": null});
        assert!(matches!(
            topics.decode(&stored),
            Err(CodecError::UnknownTopic { .. })
        ));
    }

    #[test]
    fn test_alias_resolves_renamed_topic() {
        let mut topics = registry();
        topics.alias("order.created", "order.placed");

        let stored = json!({
            "topic": "order.created",
            "body": {"order_id": "o-9", "total_cents": 10}
        });
        let message = topics.decode(&stored).unwrap();
        assert_eq!(message.topic, "order.placed");
        assert!(message.headers.is_empty());
        assert_eq!(message.body_as::<OrderPlaced>().unwrap().order_id, "o-9");
    }

    #[test]
    fn test_opaque_topic_accepts_any_body() {
        let topics = registry();
        let stored = json!({"topic": "audit.note", "body": [1, "two", null]});
        assert!(topics.decode(&stored).is_ok());
        assert!(topics.contains("audit.note"));
        assert_eq!(topics.len(), 2);
    }

    #[test]
    fn test_decode_malformed() {
        let topics = registry();
        assert!(matches!(
            topics.decode(&json!("not an object")),
            Err(CodecError::Malformed { .. })
        ));
        assert!(matches!(
            topics.decode(&json!({"body": 1})),
            Err(CodecError::Malformed { .. })
        ));
    }
}
