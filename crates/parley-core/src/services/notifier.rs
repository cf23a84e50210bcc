use tracing::{info, warn};

/// User-facing notices raised outside a message bubble.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    ConnectionLost {
        backend_id: String,
        backend_name: String,
    },
    ConnectionRestored {
        backend_id: String,
        backend_name: String,
    },
    /// Image regeneration found no earlier user message to use as prompt.
    NoPromptFound { message_id: String },
}

impl Notice {
    pub fn text(&self) -> String {
        match self {
            Notice::ConnectionLost { backend_name, .. } => {
                format!("Lost connection to {}", backend_name)
            }
            Notice::ConnectionRestored { backend_name, .. } => {
                format!("Reconnected to {}", backend_name)
            }
            Notice::NoPromptFound { .. } => "No prompt found to generate an image from".to_string(),
        }
    }
}

/// Toast-style sink for [`Notice`]s.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Notifier that only logs.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        match &notice {
            Notice::ConnectionRestored { .. } => info!(notice = ?notice, "{}", notice.text()),
            _ => warn!(notice = ?notice, "{}", notice.text()),
        }
    }
}
