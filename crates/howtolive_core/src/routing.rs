//! Routing decisions and the structured-output schema that constrains them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Decision produced by the dispatch classifier for one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Selected handler label
    pub label: String,
    /// Optional side note from the classifier
    #[serde(default)]
    pub note: Option<String>,
}

impl RoutingDecision {
    /// Label of the default handler.
    pub const GENERAL: &'static str = "general";
    /// Synonym of [`Self::GENERAL`].
    pub const NONE: &'static str = "none";

    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            note: None,
        }
    }

    /// The fallback decision.
    pub fn general() -> Self {
        Self::new(Self::GENERAL)
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Whether this decision selects the default handler by label.
    pub fn is_fallback(&self) -> bool {
        self.label == Self::GENERAL || self.label == Self::NONE
    }

    /// Structured payload recorded in the timeline.
    pub fn to_value(&self) -> Value {
        json!({ "your_choice": self.label, "note": self.note })
    }
}

/// The fixed label set a classifier may choose from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingSchema {
    specialists: Vec<String>,
}

impl RoutingSchema {
    pub fn new<I, S>(specialists: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            specialists: specialists.into_iter().map(Into::into).collect(),
        }
    }

    pub fn specialists(&self) -> &[String] {
        &self.specialists
    }

    /// All permitted labels: specialists first, then the fallbacks.
    pub fn labels(&self) -> Vec<String> {
        let mut labels = self.specialists.clone();
        labels.push(RoutingDecision::GENERAL.to_string());
        labels.push(RoutingDecision::NONE.to_string());
        labels
    }

    pub fn is_specialist(&self, label: &str) -> bool {
        self.specialists.iter().any(|s| s == label)
    }

    /// JSON schema passed to the model as the response format.
    pub fn to_json_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "your_choice": {
                    "type": "string",
                    "enum": self.labels(),
                    "description": "The handler best suited to answer the user"
                },
                "note": {
                    "type": ["string", "null"],
                    "description": "Optional remark for the selected handler"
                }
            },
            "required": ["your_choice", "note"],
            "additionalProperties": false
        })
    }

    /// Parse structured classifier output.
    ///
    /// Returns `None` when the payload has no string label. Labels outside the
    /// schema are returned as-is; mapping them to the default handler is the
    /// caller's job.
    pub fn parse(&self, metadata: &Value) -> Option<RoutingDecision> {
        let label = metadata
            .get("your_choice")
            .or_else(|| metadata.get("label"))?
            .as_str()?
            .trim();
        if label.is_empty() {
            return None;
        }
        let note = metadata
            .get("note")
            .and_then(Value::as_str)
            .filter(|n| !n.trim().is_empty())
            .map(str::to_string);
        Some(RoutingDecision {
            label: label.to_string(),
            note,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> RoutingSchema {
        RoutingSchema::new(["howtoeat", "howtocook"])
    }

    #[test]
    fn test_labels_include_fallbacks() {
        assert_eq!(
            schema().labels(),
            vec!["howtoeat", "howtocook", "general", "none"]
        );
        assert!(schema().is_specialist("howtocook"));
        assert!(!schema().is_specialist("general"));
    }

    #[test]
    fn test_json_schema_enum() {
        let value = schema().to_json_schema();
        let labels = value["properties"]["your_choice"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(labels.len(), 4);
    }

    #[test]
    fn test_parse() {
        let decision = schema()
            .parse(&json!({"your_choice": "howtocook", "note": "dinner"}))
            .unwrap();
        assert_eq!(decision.label, "howtocook");
        assert_eq!(decision.note.as_deref(), Some("dinner"));

        let decision = schema().parse(&json!({"label": "none"})).unwrap();
        assert!(decision.is_fallback());

        assert!(schema().parse(&json!({"your_choice": 3})).is_none());
        assert!(schema().parse(&json!({"your_choice": "  "})).is_none());
        assert!(schema().parse(&json!("howtocook")).is_none());
    }
}
