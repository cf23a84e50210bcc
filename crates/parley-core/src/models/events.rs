use tokio::sync::broadcast;

use super::generation_orchestrator::GenerationOutcome;

/// Change notifications fired by every mutating operation on chats and
/// messages. Each variant carries the ids needed by subscribers to filter.
#[derive(Clone, Debug, PartialEq)]
pub enum ChatEvent {
    MessageAdded {
        chat_id: String,
        message_id: String,
        index: usize,
    },
    MessageUpdated {
        message_id: String,
    },
    MessageDeleted {
        message_id: String,
    },
    VariationAdded {
        root_id: String,
        variation_id: String,
    },
    VariationRemoved {
        root_id: String,
        variation_id: String,
    },
    VariationSelected {
        root_id: String,
        selected_id: Option<String>,
    },
    EditTargetChanged {
        chat_id: String,
        message_id: Option<String>,
    },
    ChatRenamed {
        chat_id: String,
        name: String,
    },
    ChatDeleted {
        chat_id: String,
    },
    GenerationStarted {
        message_id: String,
    },
    GenerationEnded {
        message_id: String,
        outcome: GenerationOutcome,
    },
}

/// Publish/subscribe hub for [`ChatEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChatEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ChatEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(ChatEvent::ChatDeleted {
            chat_id: "c1".into(),
        });
    }

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(ChatEvent::MessageUpdated {
            message_id: "a".into(),
        });
        bus.emit(ChatEvent::MessageDeleted {
            message_id: "a".into(),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            ChatEvent::MessageUpdated {
                message_id: "a".into()
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ChatEvent::MessageDeleted {
                message_id: "a".into()
            }
        );
    }
}
