use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::chat::{ChatRecord, chat_name_from_content};
use super::edited_message::EditedMessageHandler;
use super::entity_cache::EntityCache;
use super::events::{ChatEvent, EventBus};
use super::generation_orchestrator::{GenerationOrchestrator, GenerationOutcome};
use super::message::MessageRecord;
use super::message_view::{MessageContext, MessageView};
use super::preview_images::PreviewImageHandler;
use crate::repositories::{BlobCache, RecordStore, RepositoryError, RepositoryResult};
use crate::services::{BackendRegistry, ConnectivityMonitor, Notifier};
use crate::settings::CoreSettings;

/// Collaborators shared by every chat of one store.
pub struct ChatContext {
    pub chats: Arc<dyn RecordStore<ChatRecord>>,
    pub messages: Arc<MessageContext>,
    pub orchestrator: Arc<GenerationOrchestrator>,
    pub settings: CoreSettings,
}

impl ChatContext {
    /// Wire the shared collaborators from settings.
    pub fn new(
        settings: CoreSettings,
        chats: Arc<dyn RecordStore<ChatRecord>>,
        messages: Arc<dyn RecordStore<MessageRecord>>,
        blobs: Arc<dyn BlobCache>,
        backends: Arc<BackendRegistry>,
        connectivity: Arc<ConnectivityMonitor>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let events = EventBus::new(settings.event_capacity);
        let orchestrator = Arc::new(GenerationOrchestrator::new(
            backends,
            connectivity,
            notifier,
            events.clone(),
            settings.abort_message.clone(),
        ));
        let messages = Arc::new(MessageContext {
            store: messages,
            blobs,
            events,
            flush_interval: settings.content_flush_interval(),
        });

        Arc::new(Self {
            chats,
            messages,
            orchestrator,
            settings,
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.messages.events
    }
}

/// Live view of one chat: its ordered messages, the message being edited,
/// the staged preview images, and the operations that mutate them.
pub struct ChatTimeline {
    id: String,
    record: Mutex<ChatRecord>,
    /// Serializes writes of the chat record.
    record_lock: tokio::sync::Mutex<()>,
    /// Set once `destroy` starts; the record is never written again.
    destroyed: AtomicBool,
    messages: EntityCache<MessageRecord, MessageView>,
    edited: EditedMessageHandler,
    preview_images: PreviewImageHandler,
    ctx: Arc<ChatContext>,
}

impl ChatTimeline {
    pub fn new(record: ChatRecord, ctx: Arc<ChatContext>) -> Arc<Self> {
        let message_ctx = ctx.messages.clone();
        Arc::new(Self {
            id: record.id.clone(),
            record: Mutex::new(record),
            record_lock: tokio::sync::Mutex::new(()),
            destroyed: AtomicBool::new(false),
            messages: EntityCache::with_transform(move |r: MessageRecord| {
                MessageView::new(r, message_ctx.clone())
            }),
            edited: EditedMessageHandler::new(),
            preview_images: PreviewImageHandler::new(ctx.messages.blobs.clone()),
            ctx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn record(&self) -> ChatRecord {
        self.record.lock().clone()
    }

    pub fn name(&self) -> String {
        self.record.lock().name.clone()
    }

    pub fn message_ids(&self) -> Vec<String> {
        self.record.lock().message_ids.clone()
    }

    pub fn preview_images(&self) -> &PreviewImageHandler {
        &self.preview_images
    }

    pub fn edited_message(&self) -> &EditedMessageHandler {
        &self.edited
    }

    /// Hydrate message views (and their variations) from the store.
    pub async fn load(&self) -> RepositoryResult<()> {
        let ids = self.message_ids();
        let records = self.ctx.messages.store.find_by_ids(&ids).await?;
        if records.len() < ids.len() {
            warn!(
                chat_id = %self.id,
                expected = ids.len(),
                found = records.len(),
                "Chat references missing messages"
            );
        }

        for record in records {
            let view = self.messages.put(record, false);
            view.load_variations().await?;
        }
        debug!(chat_id = %self.id, messages = ids.len(), "Loaded chat");
        Ok(())
    }

    /// Loaded messages in chat order.
    pub fn messages(&self) -> Vec<Arc<MessageView>> {
        self.message_ids()
            .iter()
            .filter_map(|id| self.messages.get(id))
            .collect()
    }

    pub fn message(&self, id: &str) -> Option<Arc<MessageView>> {
        self.messages.get(id)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.record.lock().message_ids.iter().position(|m| m == id)
    }

    /// Selected variation of every message before `view`'s slot, skipping
    /// blank ones. This is the conversation a backend sees.
    pub fn history_before(&self, view: &Arc<MessageView>) -> Vec<Arc<MessageView>> {
        let root = view.slot_root();
        let ids = self.message_ids();
        let end = ids.iter().position(|id| id == root.id()).unwrap_or(ids.len());

        ids[..end]
            .iter()
            .filter_map(|id| self.messages.get(id))
            .map(|m| m.selected_variation())
            .filter(|m| !m.is_blank())
            .collect()
    }

    /// Content of the nearest user message before `view`'s slot.
    pub fn preceding_user_prompt(&self, view: &Arc<MessageView>) -> Option<String> {
        let root = view.slot_root();
        let ids = self.message_ids();
        let end = ids.iter().position(|id| id == root.id())?;

        ids[..end]
            .iter()
            .rev()
            .filter_map(|id| self.messages.get(id))
            .find(|m| !m.from_bot())
            .map(|m| m.content())
            .filter(|content| !content.trim().is_empty())
    }

    /// Whether any message of this chat (or a variation) is receiving output.
    pub fn is_generating(&self) -> bool {
        let orchestrator = &self.ctx.orchestrator;
        self.messages().iter().any(|m| {
            orchestrator.is_pending(m.id()) || orchestrator.is_pending(m.selected_variation().id())
        })
    }

    /// Append a user message; newly staged preview images are committed to it.
    ///
    /// Returns `None` without touching anything when there is neither text
    /// nor an image to send. An unnamed chat takes its name from the first
    /// characters of the message. Sending ends edit mode; images of the
    /// edited message stay with that message.
    pub async fn add_user_message(
        &self,
        content: &str,
        images: Vec<String>,
    ) -> RepositoryResult<Option<Arc<MessageView>>> {
        if content.trim().is_empty() && images.is_empty() && !self.preview_images.has_new() {
            return Ok(None);
        }

        let mut image_urls = images;
        image_urls.extend(self.preview_images.take_new());
        if self.edited.get().is_some() {
            self.clear_edit().await;
        }

        let record = self
            .ctx
            .messages
            .store
            .create(MessageRecord::user(content, image_urls))
            .await?;
        let view = self.messages.put(record, true);

        let name = chat_name_from_content(content, self.ctx.settings.chat_name_max_chars);
        let mut renamed = None;
        let message_id = view.id().to_string();
        let timestamp = view.timestamp();
        let index = self
            .update_record(|chat| {
                chat.message_ids.push(message_id.clone());
                chat.last_message_timestamp = timestamp;
                if chat.is_unnamed() && !name.is_empty() {
                    chat.name = name.clone();
                    renamed = Some(name);
                }
                chat.message_ids.len() - 1
            })
            .await?;

        self.emit_added(&view, index);
        if let Some(name) = renamed {
            info!(chat_id = %self.id, name = %name, "Named chat");
            self.ctx.messages.events.emit(ChatEvent::ChatRenamed {
                chat_id: self.id.clone(),
                name,
            });
        }
        Ok(Some(view))
    }

    /// Append an empty bot message that a generation will stream into.
    pub async fn create_and_push_incoming_message(&self) -> RepositoryResult<Arc<MessageView>> {
        let len = self.record.lock().message_ids.len();
        self.insert_incoming_message(len).await
    }

    async fn insert_incoming_message(&self, index: usize) -> RepositoryResult<Arc<MessageView>> {
        let record = self
            .ctx
            .messages
            .store
            .create(MessageRecord::bot_placeholder())
            .await?;
        let view = self.messages.put(record, true);

        let message_id = view.id().to_string();
        let timestamp = view.timestamp();
        let index = self
            .update_record(|chat| {
                let index = index.min(chat.message_ids.len());
                chat.message_ids.insert(index, message_id);
                chat.last_message_timestamp = timestamp;
                index
            })
            .await?;

        self.emit_added(&view, index);
        Ok(view)
    }

    /// Add a user message and generate the bot reply to it.
    pub async fn send_message(
        self: &Arc<Self>,
        content: &str,
    ) -> RepositoryResult<Option<GenerationOutcome>> {
        if self.add_user_message(content, Vec::new()).await?.is_none() {
            return Ok(None);
        }
        let incoming = self.create_and_push_incoming_message().await?;
        self.ctx
            .orchestrator
            .generate_message(self, &incoming)
            .await
            .map(Some)
    }

    /// Regenerate the reply to the message being edited.
    ///
    /// When the edited message is followed by a bot message, a new variation
    /// of that reply is generated. Otherwise (the reply was deleted, or the
    /// edited message is last) an incoming message is spliced in right after
    /// it. Edit mode ends either way.
    pub async fn find_and_regenerate_response(
        self: &Arc<Self>,
    ) -> RepositoryResult<Option<GenerationOutcome>> {
        let Some(edited_id) = self.edited.get() else {
            return Ok(None);
        };
        let Some(index) = self.index_of(&edited_id) else {
            warn!(chat_id = %self.id, message_id = %edited_id, "Edited message is not in chat");
            self.clear_edit().await;
            return Ok(None);
        };

        let following = self
            .message_ids()
            .get(index + 1)
            .and_then(|id| self.messages.get(id))
            .filter(|m| m.from_bot());
        let target = match following {
            Some(reply) => reply,
            None => self.insert_incoming_message(index + 1).await?,
        };

        self.clear_edit().await;
        self.ctx
            .orchestrator
            .generate_variation(self, &target)
            .await
            .map(Some)
    }

    /// Write the edit buffer into the edited message and regenerate its reply.
    ///
    /// Images dropped from the preview are deleted from the blob cache.
    pub async fn submit_edit(
        self: &Arc<Self>,
        content: &str,
    ) -> RepositoryResult<Option<GenerationOutcome>> {
        let Some(target) = self.message_to_edit() else {
            return Ok(None);
        };

        let previous = target.image_urls();
        let kept = self.preview_images.take_for_commit();
        for reference in previous.iter().filter(|r| !kept.contains(r)) {
            if let Err(e) = self.ctx.messages.blobs.delete(reference).await {
                warn!(reference = %reference, error = ?e, "Failed to delete image blob");
            }
        }

        let content = content.to_string();
        target
            .update(move |r| {
                r.content = content;
                r.image_urls = kept;
                r.set_error(None);
            })
            .await?;

        self.find_and_regenerate_response().await
    }

    pub fn message_to_edit(&self) -> Option<Arc<MessageView>> {
        self.edited.get().and_then(|id| self.messages.get(&id))
    }

    /// Enter edit mode on `view`, staging its images for editing.
    pub async fn set_message_to_edit(&self, view: &Arc<MessageView>) {
        if self.edited.set(view.id()) {
            self.preview_images.load_from_message(view).await;
            self.emit_edit_target(Some(view.id().to_string()));
        }
    }

    /// Leave edit mode, discarding images staged but not committed.
    pub async fn clear_edit(&self) {
        self.preview_images.clear().await;
        if self.edited.clear() {
            self.emit_edit_target(None);
        }
    }

    /// Move edit mode to the closest user message above the current one
    /// (or the last user message when not editing). Stops at the top.
    pub async fn find_and_edit_previous_message(&self) -> Option<Arc<MessageView>> {
        let ids = self.message_ids();
        let start = self
            .edited
            .get()
            .and_then(|id| ids.iter().position(|m| *m == id))
            .unwrap_or(ids.len());

        let found = ids[..start]
            .iter()
            .rev()
            .filter_map(|id| self.messages.get(id))
            .find(|m| !m.from_bot())?;
        self.set_message_to_edit(&found).await;
        Some(found)
    }

    /// Move edit mode to the closest user message below the current one.
    /// Stops at the bottom; does nothing when not editing.
    pub async fn find_and_edit_next_message(&self) -> Option<Arc<MessageView>> {
        let ids = self.message_ids();
        let current = self
            .edited
            .get()
            .and_then(|id| ids.iter().position(|m| *m == id))?;

        let found = ids[current + 1..]
            .iter()
            .filter_map(|id| self.messages.get(id))
            .find(|m| !m.from_bot())?;
        self.set_message_to_edit(&found).await;
        Some(found)
    }

    /// Remove a message from the chat and destroy it with its subtree.
    ///
    /// A variation is detached from its slot instead. Any generation running
    /// into the message (or, for a root, into any of its variations) is
    /// aborted first.
    pub async fn destroy_message(&self, view: &Arc<MessageView>) -> RepositoryResult<()> {
        if let Some(root) = view.root() {
            self.ctx.orchestrator.abort_ids([view.id().to_string()]);
            return root.remove_variation(view).await;
        }
        self.ctx
            .orchestrator
            .abort_generation_for(std::slice::from_ref(view));

        let message_id = view.id().to_string();
        if self.edited.is_editing(&message_id) {
            self.clear_edit().await;
        }

        let id = message_id.clone();
        self.update_record(move |chat| chat.message_ids.retain(|m| *m != id))
            .await?;
        self.messages.remove(&message_id);
        view.destroy().await
    }

    /// Destroy every message of the chat, then the chat record.
    pub async fn destroy(&self) -> RepositoryResult<()> {
        let _guard = self.record_lock.lock().await;
        self.destroyed.store(true, Ordering::Release);
        self.ctx.orchestrator.abort_generation_for(&self.messages());
        self.preview_images.clear().await;
        self.edited.clear();

        let ids = self.message_ids();
        let records = self.ctx.messages.store.find_by_ids(&ids).await?;
        for record in records {
            let view = self.messages.get_or_put(record);
            view.destroy().await?;
        }
        self.messages.clear();
        self.ctx.chats.destroy(&self.id).await?;
        self.record.lock().message_ids.clear();

        info!(chat_id = %self.id, messages = ids.len(), "Destroyed chat");
        self.ctx.messages.events.emit(ChatEvent::ChatDeleted {
            chat_id: self.id.clone(),
        });
        Ok(())
    }

    async fn update_record<F, T>(&self, change: F) -> RepositoryResult<T>
    where
        F: FnOnce(&mut ChatRecord) -> T,
    {
        let _guard = self.record_lock.lock().await;
        if self.is_destroyed() {
            return Err(RepositoryError::NotFoundError {
                id: self.id.clone(),
            });
        }
        let mut next = self.record.lock().clone();
        let result = change(&mut next);
        let saved = self.ctx.chats.put(next).await.inspect_err(|e| {
            error!(chat_id = %self.id, error = ?e, "Failed to persist chat");
        })?;
        *self.record.lock() = saved;
        Ok(result)
    }

    fn emit_added(&self, view: &MessageView, index: usize) {
        self.ctx.messages.events.emit(ChatEvent::MessageAdded {
            chat_id: self.id.clone(),
            message_id: view.id().to_string(),
            index,
        });
    }

    fn emit_edit_target(&self, message_id: Option<String>) {
        self.ctx.messages.events.emit(ChatEvent::EditTargetChanged {
            chat_id: self.id.clone(),
            message_id,
        });
    }
}

impl std::fmt::Debug for ChatTimeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatTimeline")
            .field("id", &self.id)
            .field("messages", &self.record.lock().message_ids.len())
            .finish_non_exhaustive()
    }
}
