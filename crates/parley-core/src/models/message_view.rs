use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::entity_cache::EntityCache;
use super::events::{ChatEvent, EventBus};
use super::message::{MessageError, MessageRecord};
use crate::repositories::{BlobCache, RecordStore, RepositoryError, RepositoryResult};

/// Collaborators shared by every view of one message store.
pub struct MessageContext {
    pub store: Arc<dyn RecordStore<MessageRecord>>,
    pub blobs: Arc<dyn BlobCache>,
    pub events: EventBus,
    /// Throttle window for persisting streamed content.
    pub flush_interval: Duration,
}

/// Throttled-persistence state machine for streamed content.
#[derive(Default)]
struct FlushState {
    /// Override holds text not yet written to the store.
    dirty: bool,
    /// A flusher task is alive for this view.
    running: bool,
    last_flush: Option<Instant>,
    destroyed: bool,
}

/// Live wrapper around a [`MessageRecord`].
///
/// Streamed text accumulates in an in-memory override and is persisted on a
/// leading+trailing throttle; discrete field changes go through
/// [`MessageView::update`] and hit the store immediately. Variations of a
/// top-level message are materialized lazily into a nested identity map and
/// point back at their root through a weak reference.
pub struct MessageView {
    id: String,
    source: Mutex<MessageRecord>,
    content_override: Mutex<String>,
    flush: Mutex<FlushState>,
    /// Serializes writes of this message to the store.
    persist_lock: tokio::sync::Mutex<()>,
    pub(crate) variations: EntityCache<MessageRecord, MessageView>,
    root: Weak<MessageView>,
    pub(crate) ctx: Arc<MessageContext>,
}

impl MessageView {
    /// Wrap a top-level message.
    pub fn new(record: MessageRecord, ctx: Arc<MessageContext>) -> Arc<Self> {
        Self::build(record, ctx, Weak::new())
    }

    fn build(record: MessageRecord, ctx: Arc<MessageContext>, root: Weak<MessageView>) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<MessageView>| {
            // Variations hang off the top-level view only; a variation's own
            // variations (never populated) would point at the same root.
            let variation_root = if root.upgrade().is_some() {
                root.clone()
            } else {
                this.clone()
            };
            let variation_ctx = ctx.clone();
            let variations = EntityCache::with_transform(move |r: MessageRecord| {
                MessageView::build(r, variation_ctx.clone(), variation_root.clone())
            });

            Self {
                id: record.id.clone(),
                source: Mutex::new(record),
                content_override: Mutex::new(String::new()),
                flush: Mutex::new(FlushState::default()),
                persist_lock: tokio::sync::Mutex::new(()),
                variations,
                root,
                ctx,
            }
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the persisted record (without unflushed streamed text).
    pub fn record(&self) -> MessageRecord {
        self.source.lock().clone()
    }

    pub fn from_bot(&self) -> bool {
        self.source.lock().from_bot
    }

    pub fn timestamp(&self) -> i64 {
        self.source.lock().timestamp
    }

    pub fn bot_name(&self) -> Option<String> {
        self.source.lock().bot_name.clone()
    }

    pub fn image_urls(&self) -> Vec<String> {
        self.source.lock().image_urls.clone()
    }

    pub fn error(&self) -> Option<MessageError> {
        self.source.lock().error().cloned()
    }

    /// Effective content: streamed override when present, stored content otherwise.
    pub fn content(&self) -> String {
        let pending = self.content_override.lock();
        if pending.is_empty() {
            self.source.lock().content.clone()
        } else {
            pending.clone()
        }
    }

    /// Nothing worth keeping: no text, no image, no error.
    pub fn is_blank(&self) -> bool {
        if !self.content_override.lock().is_empty() {
            return false;
        }
        let record = self.source.lock();
        record.content.is_empty() && record.image_urls.is_empty() && record.error().is_none()
    }

    /// Top-level message this view is a variation of.
    pub fn root(&self) -> Option<Arc<MessageView>> {
        self.root.upgrade()
    }

    pub fn is_variation(&self) -> bool {
        self.root.upgrade().is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.flush.lock().destroyed
    }

    /// Append a streamed chunk.
    ///
    /// The chunk is visible through [`content`](Self::content) immediately;
    /// the store sees it on the next throttled flush. Chunks never touch
    /// `extras.error`. Must be called from within a Tokio runtime.
    pub fn update_content(self: &Arc<Self>, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        {
            let mut pending = self.content_override.lock();
            if pending.is_empty() {
                pending.push_str(&self.source.lock().content);
            }
            pending.push_str(chunk);
        }

        let spawn_flusher = {
            let mut flush = self.flush.lock();
            if flush.destroyed {
                return;
            }
            flush.dirty = true;
            !std::mem::replace(&mut flush.running, true)
        };

        self.ctx.events.emit(ChatEvent::MessageUpdated {
            message_id: self.id.clone(),
        });

        if spawn_flusher {
            tokio::spawn(self.clone().run_flusher());
        }
    }

    /// Persist the override whenever it is dirty, at most once per flush window.
    async fn run_flusher(self: Arc<Self>) {
        let interval = self.ctx.flush_interval;
        loop {
            let delay = self
                .flush
                .lock()
                .last_flush
                .map(|at| (at + interval).saturating_duration_since(Instant::now()))
                .unwrap_or_default();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let _guard = self.persist_lock.lock().await;
            let content = {
                let mut flush = self.flush.lock();
                if !flush.dirty || flush.destroyed {
                    flush.running = false;
                    return;
                }
                flush.dirty = false;
                self.content_override.lock().clone()
            };

            let mut record = self.source.lock().clone();
            record.content = content;
            match self.ctx.store.put(record).await {
                Ok(saved) => *self.source.lock() = saved,
                Err(e) => warn!(message_id = %self.id, error = ?e, "Failed to flush streamed content"),
            }
            self.flush.lock().last_flush = Some(Instant::now());
        }
    }

    /// Apply a discrete change and persist it right away.
    ///
    /// Cancels any pending throttled flush; unflushed streamed text is folded
    /// into `content` as part of the same write.
    pub async fn update<F>(&self, change: F) -> RepositoryResult<()>
    where
        F: FnOnce(&mut MessageRecord) + Send,
    {
        let _guard = self.persist_lock.lock().await;
        {
            let mut flush = self.flush.lock();
            if flush.destroyed {
                return Err(RepositoryError::NotFoundError {
                    id: self.id.clone(),
                });
            }
            flush.dirty = false;
        }

        let pending = self.content_override.lock().clone();
        let mut record = self.source.lock().clone();
        if !pending.is_empty() {
            record.content = pending.clone();
        }
        change(&mut record);

        let saved = self.ctx.store.put(record).await.inspect_err(|e| {
            error!(message_id = %self.id, error = ?e, "Failed to persist message");
        })?;
        *self.source.lock() = saved;
        {
            // Chunks that arrived during the write stay in the override
            let mut current = self.content_override.lock();
            if *current == pending {
                current.clear();
            }
        }
        self.ctx.events.emit(ChatEvent::MessageUpdated {
            message_id: self.id.clone(),
        });
        Ok(())
    }

    /// Write any unflushed streamed text now.
    pub async fn flush_now(&self) -> RepositoryResult<()> {
        let has_pending = !self.content_override.lock().is_empty();
        if has_pending {
            self.update(|_| {}).await?;
        }
        Ok(())
    }

    /// Replace the content outright. Clears any stored error.
    pub async fn set_content(&self, content: impl Into<String>) -> RepositoryResult<()> {
        let content = content.into();
        self.content_override.lock().clear();
        self.update(move |r| {
            r.content = content;
            r.set_error(None);
        })
        .await
    }

    /// Attach a terminal failure. Partial content is kept alongside it.
    pub async fn set_error(&self, error: MessageError) -> RepositoryResult<()> {
        self.update(move |r| r.set_error(Some(error))).await
    }

    pub async fn clear_error(&self) -> RepositoryResult<()> {
        if self.source.lock().error().is_none() {
            return Ok(());
        }
        self.update(|r| r.set_error(None)).await
    }

    /// Destroy this message, its variation subtree and their image blobs.
    pub async fn destroy(&self) -> RepositoryResult<()> {
        let _guard = self.persist_lock.lock().await;
        self.flush.lock().destroyed = true;
        self.content_override.lock().clear();

        let record = self.source.lock().clone();

        let variation_records = self.ctx.store.find_by_ids(&record.variation_ids).await?;
        for variation in &variation_records {
            self.delete_blobs(&variation.image_urls).await;
        }
        for variation in self.variations.values() {
            // Waits out a write the variation has in flight.
            let _variation_guard = variation.persist_lock.lock().await;
            variation.flush.lock().destroyed = true;
            variation.content_override.lock().clear();
        }
        self.ctx.store.destroy_many(&record.variation_ids).await?;
        self.variations.clear();

        self.delete_blobs(&record.image_urls).await;
        self.ctx.store.destroy(&record.id).await?;

        debug!(
            message_id = %self.id,
            variations = record.variation_ids.len(),
            "Destroyed message"
        );
        self.ctx.events.emit(ChatEvent::MessageDeleted {
            message_id: self.id.clone(),
        });
        Ok(())
    }

    async fn delete_blobs(&self, references: &[String]) {
        for reference in references {
            if let Err(e) = self.ctx.blobs.delete(reference).await {
                warn!(reference = %reference, error = ?e, "Failed to delete image blob");
            }
        }
    }
}

impl std::fmt::Debug for MessageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageView")
            .field("id", &self.id)
            .field("is_variation", &self.is_variation())
            .finish_non_exhaustive()
    }
}
