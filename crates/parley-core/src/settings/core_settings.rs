use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the conversation core. Unknown or missing fields fall back
/// to their defaults, so older settings files keep loading.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Throttle window for persisting streamed content.
    pub content_flush_interval_ms: u64,
    /// Unnamed chats take their name from this many characters of the first message.
    pub chat_name_max_chars: usize,
    /// Inline error attached to a message stopped by the user.
    pub abort_message: String,
    pub event_capacity: usize,
    pub connectivity_timeout_ms: u64,
}

impl CoreSettings {
    pub fn content_flush_interval(&self) -> Duration {
        Duration::from_millis(self.content_flush_interval_ms)
    }

    pub fn connectivity_timeout(&self) -> Duration {
        Duration::from_millis(self.connectivity_timeout_ms)
    }
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            content_flush_interval_ms: 3_000,
            chat_name_max_chars: 40,
            abort_message: "Stream stopped by user".to_string(),
            event_capacity: 256,
            connectivity_timeout_ms: 5_000,
        }
    }
}
