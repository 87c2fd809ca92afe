//! Message envelope: payload plus delivery metadata.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::QueueError;

/// A queued message and its delivery metadata.
///
/// Envelopes are values: every `with_*` method returns a modified copy and
/// leaves the receiver untouched, so two consumers never observe each other's
/// changes to the same message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    payload: Value,
    id: Option<u64>,
    attempts: u32,
    reply_to: Option<String>,
    correlation_id: Option<String>,
    original: Option<Arc<Envelope>>,
}

impl Envelope {
    /// Create an envelope around an already-encoded payload.
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            id: None,
            attempts: 0,
            reply_to: None,
            correlation_id: None,
            original: None,
        }
    }

    /// Create an envelope by encoding any serializable payload.
    pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Self, QueueError> {
        Ok(Self::new(serde_json::to_value(payload)?))
    }

    /// Build a response to `request`, carrying its correlation id.
    ///
    /// The request is kept as the response's `original`.
    pub fn reply_for(request: &Envelope, payload: Value) -> Self {
        Self::new(payload)
            .with_correlation_id(request.correlation_id.clone())
            .with_original(request.clone())
    }

    /// Decode the payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(T::deserialize(&self.payload)?)
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// Transport-assigned id; `None` until persisted or received.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn original(&self) -> Option<&Envelope> {
        self.original.as_deref()
    }

    pub fn with_id(&self, id: u64) -> Self {
        Self {
            id: Some(id),
            ..self.clone()
        }
    }

    pub fn with_attempts(&self, attempts: u32) -> Self {
        Self {
            attempts,
            ..self.clone()
        }
    }

    pub fn with_reply_to(&self, reply_to: Option<String>) -> Self {
        Self {
            reply_to,
            ..self.clone()
        }
    }

    pub fn with_correlation_id(&self, correlation_id: Option<String>) -> Self {
        Self {
            correlation_id,
            ..self.clone()
        }
    }

    pub fn with_original(&self, original: Envelope) -> Self {
        Self {
            original: Some(Arc::new(original)),
            ..self.clone()
        }
    }
}

/// Treat empty strings the same as absent values.
pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Resize {
        image: String,
        width: u32,
    }

    #[test]
    fn test_new_envelope_defaults() {
        let msg = Envelope::new(json!("string"));

        assert_eq!(msg.payload(), &json!("string"));
        assert!(msg.id().is_none());
        assert_eq!(msg.attempts(), 0);
        assert!(msg.reply_to().is_none());
        assert!(msg.correlation_id().is_none());
        assert!(msg.original().is_none());
    }

    #[test]
    fn test_with_methods_copy_on_write() {
        let msg = Envelope::new(json!({"k": 1}));
        let stamped = msg
            .with_id(42)
            .with_attempts(3)
            .with_reply_to(Some("replies".into()))
            .with_correlation_id(Some("abc".into()));

        assert!(msg.id().is_none());
        assert_eq!(msg.attempts(), 0);
        assert_eq!(stamped.id(), Some(42));
        assert_eq!(stamped.attempts(), 3);
        assert_eq!(stamped.reply_to(), Some("replies"));
        assert_eq!(stamped.correlation_id(), Some("abc"));
        assert_eq!(stamped.payload(), msg.payload());
    }

    #[test]
    fn test_typed_payload() {
        let job = Resize {
            image: "cat.png".into(),
            width: 640,
        };
        let msg = Envelope::encode(&job).unwrap();
        let decoded: Resize = msg.decode().unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_decode_wrong_type_fails() {
        let msg = Envelope::new(json!("not a struct"));
        let result: Result<Resize, _> = msg.decode();
        assert!(matches!(result, Err(QueueError::Serialization(_))));
    }

    #[test]
    fn test_reply_for_carries_correlation() {
        let request = Envelope::new(json!("ping"))
            .with_id(7)
            .with_correlation_id(Some("c0ffee".into()))
            .with_reply_to(Some("_rpc_replies".into()));

        let response = Envelope::reply_for(&request, json!("pong"));

        assert_eq!(response.correlation_id(), Some("c0ffee"));
        assert!(response.reply_to().is_none());
        assert!(response.id().is_none());
        assert_eq!(response.original().and_then(|o| o.id()), Some(7));
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(Some("x")), Some("x"));
        assert_eq!(non_empty(Some("")), None);
        assert_eq!(non_empty(None), None);
    }
}
