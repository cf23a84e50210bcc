use parking_lot::Mutex;

/// Pointer to the one message currently being edited in a chat.
///
/// Stored as an id and resolved through the chat's message cache on read,
/// so a destroyed message is never kept alive by this handler.
#[derive(Default)]
pub struct EditedMessageHandler {
    message_id: Mutex<Option<String>>,
}

impl EditedMessageHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        self.message_id.lock().clone()
    }

    /// Returns `true` if the pointer changed.
    pub fn set(&self, message_id: impl Into<String>) -> bool {
        let message_id = message_id.into();
        let mut current = self.message_id.lock();
        if current.as_deref() == Some(message_id.as_str()) {
            return false;
        }
        *current = Some(message_id);
        true
    }

    /// Returns `true` if something was being edited.
    pub fn clear(&self) -> bool {
        self.message_id.lock().take().is_some()
    }

    pub fn is_editing(&self, message_id: &str) -> bool {
        self.message_id.lock().as_deref() == Some(message_id)
    }
}
