//! Dispatch classifier adapter.
//!
//! Wraps one classifier call per turn. The classifier only produces a
//! structured payload; anything unusable becomes the `general` decision.

use howtolive_core::{Classifier, Message, RoutingDecision, RoutingSchema};
use tracing::{debug, warn};

/// Turns classifier output into a [`RoutingDecision`] from the fixed label set.
#[derive(Debug, Clone)]
pub struct DispatchClassifier {
    schema: RoutingSchema,
}

impl DispatchClassifier {
    pub fn new(schema: RoutingSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &RoutingSchema {
        &self.schema
    }

    /// Classify a message. Never fails.
    ///
    /// Missing or malformed metadata, an invoke error, or a label outside the
    /// schema all yield `general`.
    pub async fn classify(&self, classifier: &dyn Classifier, message: &Message) -> RoutingDecision {
        let output = match classifier.invoke(message, &self.schema).await {
            Ok(output) => output,
            Err(e) => {
                warn!(router = classifier.name(), error = %e, "Classifier failed, routing to general");
                return RoutingDecision::general();
            }
        };

        let Some(metadata) = output.metadata else {
            debug!(router = classifier.name(), "Classifier returned no metadata");
            return RoutingDecision::general();
        };

        let Some(decision) = self.schema.parse(&metadata) else {
            debug!(router = classifier.name(), %metadata, "Malformed routing metadata");
            return RoutingDecision::general();
        };

        if decision.is_fallback() || self.schema.is_specialist(&decision.label) {
            debug!(label = %decision.label, note = ?decision.note, "Routing decision");
            decision
        } else {
            debug!(label = %decision.label, "Label outside routing schema, using general");
            RoutingDecision {
                label: RoutingDecision::GENERAL.to_string(),
                note: decision.note,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use howtolive_core::mock::ScriptedClassifier;
    use serde_json::json;

    fn dispatcher() -> DispatchClassifier {
        DispatchClassifier::new(RoutingSchema::new(["howtoeat", "howtocook"]))
    }

    #[tokio::test]
    async fn test_specialist_label_passes_through() {
        let classifier = ScriptedClassifier::with_metadata(json!({
            "your_choice": "howtocook",
            "note": "high protein"
        }));
        let decision = dispatcher().classify(&classifier, &Message::user("dinner")).await;
        assert_eq!(decision.label, "howtocook");
        assert_eq!(decision.note.as_deref(), Some("high protein"));
        assert_eq!(classifier.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unusable_output_defaults_to_general() {
        let cases = vec![
            ScriptedClassifier::empty(),
            ScriptedClassifier::failing("timeout"),
            ScriptedClassifier::with_metadata(json!({"your_choice": 5})),
            ScriptedClassifier::with_metadata(json!("howtocook")),
            ScriptedClassifier::routing_to("astrology"),
        ];

        for classifier in cases {
            let decision = dispatcher().classify(&classifier, &Message::user("hm")).await;
            assert_eq!(decision.label, "general");
            assert_eq!(classifier.call_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_none_is_kept_as_fallback() {
        let classifier = ScriptedClassifier::routing_to("none");
        let decision = dispatcher().classify(&classifier, &Message::user("hello")).await;
        assert!(decision.is_fallback());
    }
}
