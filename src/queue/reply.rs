//! Correlation bookkeeping shared by the reply channel implementations.

use uuid::Uuid;

use super::envelope::non_empty;
use super::Envelope;
use crate::error::QueueError;

/// Generate a fresh correlation id: 128 random bits as lowercase hex.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Correlation id and response accounting for one reply channel.
#[derive(Debug, Clone, Default)]
pub(crate) struct ReplyState {
    correlation_id: Option<String>,
    expected: Option<u32>,
    responses: u32,
}

impl ReplyState {
    pub(crate) fn new(correlation_id: Option<String>) -> Self {
        Self {
            correlation_id,
            ..Default::default()
        }
    }

    pub(crate) fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub(crate) fn set_correlation_id(&mut self, correlation_id: String) {
        self.correlation_id = Some(correlation_id);
    }

    pub(crate) fn expected(&self) -> Option<u32> {
        self.expected
    }

    pub(crate) fn set_expected(&mut self, count: Option<u32>) {
        self.expected = count;
    }

    /// An unset count becomes `by`.
    pub(crate) fn increment_expected(&mut self, by: u32) {
        self.expected = Some(self.expected.unwrap_or(0).saturating_add(by));
    }

    pub(crate) fn responses(&self) -> u32 {
        self.responses
    }

    pub(crate) fn record_response(&mut self) {
        self.responses = self.responses.saturating_add(1);
    }

    /// Whether enough responses arrived to stop waiting.
    pub(crate) fn is_satisfied(&self) -> bool {
        matches!(self.expected, Some(expected) if self.responses >= expected)
    }

    /// Whether a delivered correlation id belongs to this channel.
    ///
    /// A channel without a correlation id accepts everything.
    pub(crate) fn matches(&self, correlation_id: Option<&str>) -> bool {
        match self.correlation_id() {
            Some(own) => correlation_id == Some(own),
            None => true,
        }
    }

    /// Pick the correlation id a reply should be stored under.
    ///
    /// The envelope's own id wins; the channel's id is the fallback.
    pub(crate) fn outgoing_correlation_id(&self, envelope: &Envelope) -> Result<String, QueueError> {
        non_empty(envelope.correlation_id())
            .or_else(|| non_empty(self.correlation_id()))
            .map(str::to_string)
            .ok_or(QueueError::MissingCorrelationId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_correlation_id_format() {
        let a = new_correlation_id();
        let b = new_correlation_id();

        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_unbounded_until_expected_set() {
        let mut state = ReplyState::new(Some("abc".into()));
        state.record_response();
        state.record_response();
        assert!(!state.is_satisfied());

        state.set_expected(Some(2));
        assert!(state.is_satisfied());

        state.set_expected(None);
        assert!(!state.is_satisfied());
    }

    #[test]
    fn test_increment_expected_from_unset() {
        let mut state = ReplyState::default();
        state.increment_expected(1);
        assert_eq!(state.expected(), Some(1));
        state.increment_expected(2);
        assert_eq!(state.expected(), Some(3));
    }

    #[test]
    fn test_matches() {
        let state = ReplyState::new(Some("abc".into()));
        assert!(state.matches(Some("abc")));
        assert!(!state.matches(Some("other")));
        assert!(!state.matches(None));

        let open = ReplyState::default();
        assert!(open.matches(Some("anything")));
        assert!(open.matches(None));
    }

    #[test]
    fn test_outgoing_correlation_prefers_envelope() {
        let state = ReplyState::new(Some("channel".into()));

        let own = Envelope::new(json!(1)).with_correlation_id(Some("message".into()));
        assert_eq!(state.outgoing_correlation_id(&own).unwrap(), "message");

        let bare = Envelope::new(json!(1)).with_correlation_id(Some(String::new()));
        assert_eq!(state.outgoing_correlation_id(&bare).unwrap(), "channel");
    }

    #[test]
    fn test_outgoing_correlation_missing() {
        let state = ReplyState::default();
        let bare = Envelope::new(json!(1));
        assert!(matches!(
            state.outgoing_correlation_id(&bare),
            Err(QueueError::MissingCorrelationId)
        ));
    }
}
