use serde::{Deserialize, Serialize};

use super::clock::next_timestamp;
use crate::repositories::{Record, RepositoryError, RepositoryResult};

/// Persisted conversation. Owns its messages by id only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message_ids: Vec<String>,
    pub last_message_timestamp: i64,
}

impl ChatRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            message_ids: Vec::new(),
            last_message_timestamp: next_timestamp(),
        }
    }

    pub fn is_unnamed(&self) -> bool {
        self.name.trim().is_empty()
    }
}

impl Record for ChatRecord {
    const TABLE: &'static str = "chats";

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn validate(&self) -> RepositoryResult<()> {
        if self.id.is_empty() {
            return Err(RepositoryError::validation("chat id is empty"));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.message_ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(RepositoryError::validation(format!(
                "chat {} lists message {} twice",
                self.id, dup
            )));
        }
        Ok(())
    }
}

/// Chat name derived from the first message: at most `max_chars` characters.
pub fn chat_name_from_content(content: &str, max_chars: usize) -> String {
    content.trim().chars().take(max_chars).collect()
}
