use serde::{Deserialize, Serialize};

use super::clock::next_timestamp;
use crate::repositories::{Record, RepositoryError, RepositoryResult};

/// Terminal failure attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl MessageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Map any error into the persisted shape; the source chain becomes the stack.
    pub fn from_error(error: &anyhow::Error) -> Self {
        let chain: Vec<String> = error.chain().skip(1).map(|c| c.to_string()).collect();
        Self {
            message: error.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
        }
    }
}

/// Failure or diagnostic payload stored alongside a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageExtras {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MessageError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl MessageExtras {
    pub fn is_empty(&self) -> bool {
        self.error.is_none() && self.details.is_none()
    }
}

/// Persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub from_bot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(default)]
    pub content: String,
    /// References into the blob cache, in attachment order.
    #[serde(default)]
    pub image_urls: Vec<String>,
    /// Alternate completions for this turn, in creation order.
    #[serde(default)]
    pub variation_ids: Vec<String>,
    /// `None` or the record's own id selects the root; any other id must be
    /// listed in `variation_ids`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_variation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<MessageExtras>,
    pub timestamp: i64,
}

impl MessageRecord {
    fn new(from_bot: bool, content: String, image_urls: Vec<String>) -> Self {
        Self {
            id: String::new(),
            from_bot,
            bot_name: None,
            model_type: None,
            content,
            image_urls,
            variation_ids: Vec::new(),
            selected_variation_id: None,
            extras: None,
            timestamp: next_timestamp(),
        }
    }

    /// Unsaved user message; the store assigns the id on `create`.
    pub fn user(content: impl Into<String>, image_urls: Vec<String>) -> Self {
        Self::new(false, content.into(), image_urls)
    }

    /// Unsaved, empty bot message about to receive streamed content.
    pub fn bot_placeholder() -> Self {
        Self::new(true, String::new(), Vec::new())
    }

    pub fn error(&self) -> Option<&MessageError> {
        self.extras.as_ref().and_then(|e| e.error.as_ref())
    }

    /// Replace the stored error, keeping any diagnostic details.
    pub fn set_error(&mut self, error: Option<MessageError>) {
        let extras = self.extras.get_or_insert_with(MessageExtras::default);
        extras.error = error;
        if extras.is_empty() {
            self.extras = None;
        }
    }
}

impl Record for MessageRecord {
    const TABLE: &'static str = "messages";

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn validate(&self) -> RepositoryResult<()> {
        if self.id.is_empty() {
            return Err(RepositoryError::validation("message id is empty"));
        }
        if self.variation_ids.iter().any(|v| v == &self.id) {
            return Err(RepositoryError::validation(format!(
                "message {} lists itself as a variation",
                self.id
            )));
        }
        if let Some(selected) = &self.selected_variation_id
            && selected != &self.id
            && !self.variation_ids.contains(selected)
        {
            return Err(RepositoryError::validation(format!(
                "message {} selects unknown variation {}",
                self.id, selected
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saved(mut record: MessageRecord, id: &str) -> MessageRecord {
        record.id = id.to_string();
        record
    }

    #[test]
    fn test_validate_rejects_self_variation() {
        let mut record = saved(MessageRecord::bot_placeholder(), "m1");
        record.variation_ids.push("m1".into());
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_dangling_selection() {
        let mut record = saved(MessageRecord::bot_placeholder(), "m1");
        record.variation_ids.push("m2".into());
        record.selected_variation_id = Some("m3".into());
        assert!(record.validate().is_err());

        record.selected_variation_id = Some("m2".into());
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_validate_accepts_selecting_itself() {
        let mut record = saved(MessageRecord::bot_placeholder(), "m1");
        record.selected_variation_id = Some("m1".into());
        assert!(record.validate().is_ok());

        record.variation_ids.push("m2".into());
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_set_error_keeps_details() {
        let mut record = saved(MessageRecord::bot_placeholder(), "m1");
        record.extras = Some(MessageExtras {
            error: None,
            details: Some("took 3s".into()),
        });

        record.set_error(Some(MessageError::new("boom")));
        assert_eq!(record.error().map(|e| e.message.as_str()), Some("boom"));

        record.set_error(None);
        assert!(record.error().is_none());
        assert_eq!(
            record.extras.as_ref().and_then(|e| e.details.as_deref()),
            Some("took 3s")
        );
    }

    #[test]
    fn test_clearing_only_error_drops_extras() {
        let mut record = saved(MessageRecord::bot_placeholder(), "m1");
        record.set_error(Some(MessageError::new("boom")));
        record.set_error(None);
        assert!(record.extras.is_none());
    }

    #[test]
    fn test_error_from_anyhow_chain() {
        let err = anyhow::anyhow!("connection refused").context("model request failed");
        let mapped = MessageError::from_error(&err);
        assert_eq!(mapped.message, "model request failed");
        assert_eq!(mapped.stack.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_serializes_camel_case() {
        let record = saved(MessageRecord::user("hi", vec!["blob:1".into()]), "m1");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["fromBot"], false);
        assert_eq!(json["imageUrls"][0], "blob:1");
        assert!(json.get("selectedVariationId").is_none());
    }
}
