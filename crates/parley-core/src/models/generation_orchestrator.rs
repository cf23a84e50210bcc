use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::chat_timeline::ChatTimeline;
use super::events::{ChatEvent, EventBus};
use super::message::MessageError;
use super::message_view::MessageView;
use crate::repositories::blob_cache::decode_image_payload;
use crate::repositories::{RepositoryError, RepositoryResult, store_image};
use crate::services::{
    BackendAdapter, BackendConfig, BackendRegistry, CancelFlag, ConnectivityMonitor, Notice,
    Notifier,
};

/// Terminal state of one generation run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Finished; the message stays in history.
    Committed,
    /// Backend failure; the error is stored on the message.
    Errored,
    /// Stopped by the user with partial output kept.
    Aborted,
    /// Nothing worth keeping was produced; the message was destroyed.
    Deleted,
    /// Image regeneration without a user prompt before it.
    NoPromptFound,
    /// The target already had a generation in flight; nothing was started.
    AlreadyPending,
}

/// Failure of a generator callback. Only `Repository` escapes the
/// orchestrator; everything else becomes message state.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("No active backend configured")]
    NoActiveBackend,

    #[error("No prompt found to generate an image from")]
    NoPromptFound,

    #[error("Generation cancelled")]
    Cancelled,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

struct PendingGeneration {
    cancel: CancelFlag,
    adapter: Option<Arc<dyn BackendAdapter>>,
}

/// Single authority over which messages are receiving bot output, and the
/// only component that talks to backend adapters.
///
/// Any number of different messages may generate concurrently, each with its
/// own cancel flag; a message id is never generated into twice at once.
pub struct GenerationOrchestrator {
    backends: Arc<BackendRegistry>,
    connectivity: Arc<ConnectivityMonitor>,
    notifier: Arc<dyn Notifier>,
    events: EventBus,
    abort_message: String,
    pending: Mutex<HashMap<String, PendingGeneration>>,
    aborted: Mutex<HashSet<String>>,
}

impl GenerationOrchestrator {
    pub fn new(
        backends: Arc<BackendRegistry>,
        connectivity: Arc<ConnectivityMonitor>,
        notifier: Arc<dyn Notifier>,
        events: EventBus,
        abort_message: impl Into<String>,
    ) -> Self {
        Self {
            backends,
            connectivity,
            notifier,
            events,
            abort_message: abort_message.into(),
            pending: Mutex::new(HashMap::new()),
            aborted: Mutex::new(HashSet::new()),
        }
    }

    pub fn backends(&self) -> &Arc<BackendRegistry> {
        &self.backends
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending.lock().contains_key(message_id)
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.lock().keys().cloned().collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Generate into the selected variation of `target` using the active backend.
    pub async fn generate_message(
        &self,
        chat: &Arc<ChatTimeline>,
        target: &Arc<MessageView>,
    ) -> RepositoryResult<GenerationOutcome> {
        let target = target.selected_variation();
        let message_id = target.id().to_string();
        let cancel = CancelFlag::new();

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&message_id) {
                warn!(message_id = %message_id, "Generation already in flight for message");
                return Ok(GenerationOutcome::AlreadyPending);
            }
            self.aborted.lock().remove(&message_id);
            pending.insert(
                message_id.clone(),
                PendingGeneration {
                    cancel: cancel.clone(),
                    adapter: None,
                },
            );
        }
        self.events.emit(ChatEvent::GenerationStarted {
            message_id: message_id.clone(),
        });

        let Some((config, adapter)) = self.backends.active() else {
            return self
                .handle_incoming_message(chat, &target, None, async {
                    Err(GenerationError::NoActiveBackend)
                })
                .await;
        };

        if let Some(entry) = self.pending.lock().get_mut(&message_id) {
            entry.adapter = Some(adapter.clone());
        }
        debug!(
            message_id = %message_id,
            backend_id = %config.id,
            model = ?config.model,
            "Starting generation"
        );

        if config.kind.is_image_generation() {
            let run = self.generate_image(chat, &target, &config, adapter, cancel);
            self.handle_incoming_message(chat, &target, Some(&config), run)
                .await
        } else {
            let run = self.generate_text(chat, &target, &config, adapter, cancel);
            self.handle_incoming_message(chat, &target, Some(&config), run)
                .await
        }
    }

    /// Regenerate: write into a fresh sibling variation when the current
    /// selection has content, or reuse it in place when it never got any.
    pub async fn generate_variation(
        &self,
        chat: &Arc<ChatTimeline>,
        target: &Arc<MessageView>,
    ) -> RepositoryResult<GenerationOutcome> {
        let current = target.selected_variation();
        let destination = if current.is_blank() {
            current
        } else {
            target.slot_root().create_variation().await?
        };
        self.generate_message(chat, &destination).await
    }

    /// Run `generator` for `target` and settle the message afterwards:
    /// record the failure (if any), then delete the message when it ended
    /// up blank or was aborted before producing anything, otherwise commit it.
    pub async fn handle_incoming_message<G>(
        &self,
        chat: &Arc<ChatTimeline>,
        target: &Arc<MessageView>,
        backend: Option<&BackendConfig>,
        generator: G,
    ) -> RepositoryResult<GenerationOutcome>
    where
        G: Future<Output = Result<(), GenerationError>> + Send,
    {
        let message_id = target.id().to_string();
        let result = generator.await;
        let manually_aborted = self.aborted.lock().remove(&message_id);

        let mut outcome = GenerationOutcome::Committed;
        let mut should_delete = false;
        let mut failure = None;

        match result {
            Err(GenerationError::Repository(e)) => {
                if !is_gone(chat, target) {
                    warn!(message_id = %message_id, error = ?e, "Store failure during generation");
                    failure = Some(e);
                }
            }
            _ if manually_aborted => {
                info!(message_id = %message_id, "Generation stopped by user");
                outcome = GenerationOutcome::Aborted;
                should_delete = target.content().is_empty();
                if !is_gone(chat, target)
                    && let Err(e) = target
                        .set_error(MessageError::new(self.abort_message.clone()))
                        .await
                    && !is_gone(chat, target)
                {
                    failure = Some(e);
                }
            }
            Ok(()) => {}
            Err(GenerationError::NoPromptFound) => {
                outcome = GenerationOutcome::NoPromptFound;
                self.notifier.notify(Notice::NoPromptFound {
                    message_id: message_id.clone(),
                });
            }
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Generation failed");
                outcome = GenerationOutcome::Errored;
                let error = match &e {
                    GenerationError::Backend(inner) => MessageError::from_error(inner),
                    other => MessageError::new(other.to_string()),
                };
                if !is_gone(chat, target)
                    && let Err(e) = target.set_error(error).await
                    && !is_gone(chat, target)
                {
                    failure = Some(e);
                }
                if let (GenerationError::Backend(_), Some(config)) = (&e, backend) {
                    self.spawn_connectivity_check(config.clone());
                }
            }
        }

        // Leave the pending set before settling so deletion never re-enters
        // abort. A stop pressed while the error was being written is dropped
        // together with the entry.
        {
            let mut pending = self.pending.lock();
            pending.remove(&message_id);
            self.aborted.lock().remove(&message_id);
        }

        let settled = if is_gone(chat, target) {
            Ok(GenerationOutcome::Deleted)
        } else if should_delete || target.is_blank() {
            debug!(message_id = %message_id, "Deleting blank generated message");
            chat.destroy_message(target)
                .await
                .map(|_| match outcome {
                    GenerationOutcome::NoPromptFound => outcome,
                    _ => GenerationOutcome::Deleted,
                })
        } else {
            debug!(message_id = %message_id, outcome = ?outcome, "Committing generated message");
            target.flush_now().await.map(|_| outcome)
        };
        // The chat or slot was torn down underneath the settle
        let settled = match settled {
            Err(_) if is_gone(chat, target) => Ok(GenerationOutcome::Deleted),
            other => other,
        };

        let outcome = match (failure, settled) {
            (Some(e), _) | (None, Err(e)) => {
                self.events.emit(ChatEvent::GenerationEnded {
                    message_id,
                    outcome: GenerationOutcome::Errored,
                });
                return Err(e);
            }
            (None, Ok(outcome)) => outcome,
        };

        self.events.emit(ChatEvent::GenerationEnded {
            message_id,
            outcome,
        });
        Ok(outcome)
    }

    /// Stop one generation (the given message or its selected variation), or
    /// every pending generation when `target` is `None`.
    pub fn abort_generation(&self, target: Option<&Arc<MessageView>>) {
        match target {
            Some(view) => {
                let selected = view.selected_variation();
                if !self.abort_id(view.id()) && !self.abort_id(selected.id()) {
                    debug!(message_id = %view.id(), "Abort requested for idle message");
                }
            }
            None => {
                let flags: Vec<CancelFlag> = {
                    let pending = self.pending.lock();
                    let mut aborted = self.aborted.lock();
                    aborted.extend(pending.keys().cloned());
                    pending.values().map(|p| p.cancel.clone()).collect()
                };
                for cancel in &flags {
                    cancel.cancel();
                }
                for adapter in self.backends.adapters() {
                    adapter.cancel_generation(None);
                }
                info!(count = flags.len(), "Abort requested for all generations");
            }
        }
    }

    /// Abort every pending generation into the slots of `views`: the root
    /// and each of its variations, selected or not.
    pub fn abort_generation_for(&self, views: &[Arc<MessageView>]) {
        for view in views {
            let root = view.slot_root();
            let slot = std::iter::once(root.id().to_string()).chain(root.record().variation_ids);
            self.abort_ids(slot);
        }
    }

    /// Abort the generations running into exactly these message ids.
    pub fn abort_ids(&self, ids: impl IntoIterator<Item = String>) {
        for id in ids {
            self.abort_id(&id);
        }
    }

    fn abort_id(&self, id: &str) -> bool {
        // Marked under the pending lock so the mark can never outlive the entry
        let found = {
            let pending = self.pending.lock();
            pending.get(id).map(|p| {
                self.aborted.lock().insert(id.to_string());
                (p.cancel.clone(), p.adapter.clone())
            })
        };
        let Some((cancel, adapter)) = found else {
            return false;
        };

        cancel.cancel();
        if let Some(adapter) = adapter {
            adapter.cancel_generation(Some(id));
        }
        info!(message_id = %id, "Abort requested");
        true
    }

    async fn generate_text(
        &self,
        chat: &Arc<ChatTimeline>,
        target: &Arc<MessageView>,
        config: &BackendConfig,
        adapter: Arc<dyn BackendAdapter>,
        cancel: CancelFlag,
    ) -> Result<(), GenerationError> {
        let history = chat.history_before(&target.slot_root());
        stamp_backend(target, config).await?;

        let mut stream = adapter
            .generate_chat(history, target.clone(), cancel.clone())
            .await?;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            target.update_content(&chunk);
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled);
            }
        }

        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        Ok(())
    }

    async fn generate_image(
        &self,
        chat: &Arc<ChatTimeline>,
        target: &Arc<MessageView>,
        config: &BackendConfig,
        adapter: Arc<dyn BackendAdapter>,
        cancel: CancelFlag,
    ) -> Result<(), GenerationError> {
        let prompt = chat
            .preceding_user_prompt(&target.slot_root())
            .ok_or(GenerationError::NoPromptFound)?;
        stamp_backend(target, config).await?;

        let payloads = adapter
            .generate_images(prompt, target.clone(), cancel.clone())
            .await?;
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }

        let mut references = Vec::with_capacity(payloads.len());
        for payload in &payloads {
            let bytes = decode_image_payload(payload)
                .map_err(|e| GenerationError::Backend(anyhow::Error::new(e)))?;
            references.push(store_image(target.ctx.blobs.as_ref(), bytes).await?);
        }

        target
            .update(move |r| r.image_urls.extend(references))
            .await?;
        Ok(())
    }

    fn spawn_connectivity_check(&self, config: BackendConfig) {
        let monitor = self.connectivity.clone();
        tokio::spawn(async move {
            monitor.recheck(&config).await;
        });
    }
}

/// The target no longer belongs to a live chat slot; whoever removed it also
/// removed its record.
fn is_gone(chat: &ChatTimeline, target: &MessageView) -> bool {
    chat.is_destroyed()
        || target.is_destroyed()
        || target.root().is_some_and(|root| root.is_destroyed())
}

/// Record which backend produced the message and drop any stale error.
async fn stamp_backend(target: &MessageView, config: &BackendConfig) -> RepositoryResult<()> {
    let bot_name = config.name.clone();
    let model_type = config.model.clone();
    target
        .update(move |r| {
            r.bot_name = Some(bot_name);
            r.model_type = model_type;
            r.set_error(None);
        })
        .await
}
