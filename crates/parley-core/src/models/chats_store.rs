use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::chat::ChatRecord;
use super::chat_timeline::{ChatContext, ChatTimeline};
use super::entity_cache::EntityCache;
use super::message::MessageRecord;
use crate::repositories::RepositoryResult;

/// A message matching a search query, resolved to the chat that shows it.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    pub chat_id: String,
    pub chat_name: String,
    pub message_id: String,
    pub content: String,
}

/// Entry point to all chats. Hands out one [`ChatTimeline`] per chat id.
pub struct ChatStore {
    ctx: Arc<ChatContext>,
    timelines: EntityCache<ChatRecord, ChatTimeline>,
}

impl ChatStore {
    pub fn new(ctx: Arc<ChatContext>) -> Self {
        let timeline_ctx = ctx.clone();
        Self {
            ctx,
            timelines: EntityCache::with_transform(move |record: ChatRecord| {
                ChatTimeline::new(record, timeline_ctx.clone())
            }),
        }
    }

    pub fn context(&self) -> &Arc<ChatContext> {
        &self.ctx
    }

    pub async fn create_chat(&self, name: &str) -> RepositoryResult<Arc<ChatTimeline>> {
        let record = self.ctx.chats.create(ChatRecord::new(name)).await?;
        info!(chat_id = %record.id, "Created chat");
        Ok(self.timelines.put(record, true))
    }

    /// Loaded timeline for `chat_id`, hydrating it on first access.
    pub async fn open_chat(&self, chat_id: &str) -> RepositoryResult<Option<Arc<ChatTimeline>>> {
        if let Some(timeline) = self.timelines.get(chat_id) {
            return Ok(Some(timeline));
        }

        let Some(record) = self.ctx.chats.find_by_id(chat_id).await? else {
            return Ok(None);
        };
        let timeline = self.timelines.put(record, false);
        timeline.load().await?;
        Ok(Some(timeline))
    }

    /// All chats, most recently active first.
    pub async fn list_chats(&self) -> RepositoryResult<Vec<ChatRecord>> {
        let mut chats = Vec::new();
        self.ctx
            .chats
            .iterate(&mut |record: ChatRecord| chats.push(record))
            .await?;

        // Prefer the live record when a timeline is open
        let mut chats: Vec<ChatRecord> = chats
            .into_iter()
            .map(|record| match self.timelines.get(&record.id) {
                Some(timeline) => timeline.record(),
                None => record,
            })
            .collect();
        chats.sort_by(|a, b| b.last_message_timestamp.cmp(&a.last_message_timestamp));
        Ok(chats)
    }

    /// Destroy a chat with all of its messages, variations and images.
    pub async fn destroy_chat(&self, chat_id: &str) -> RepositoryResult<bool> {
        let Some(timeline) = self.open_chat(chat_id).await? else {
            return Ok(false);
        };
        timeline.destroy().await?;
        self.timelines.remove(chat_id);
        Ok(true)
    }

    /// Case-insensitive substring search over message text. Variations are
    /// reported against the chat of their root message.
    pub async fn search(&self, query: &str) -> RepositoryResult<Vec<SearchHit>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let mut matches = Vec::new();
        let mut variation_roots: HashMap<String, String> = HashMap::new();
        self.ctx
            .messages
            .store
            .iterate(&mut |record: MessageRecord| {
                for variation in &record.variation_ids {
                    variation_roots.insert(variation.clone(), record.id.clone());
                }
                if record.content.to_lowercase().contains(&needle) {
                    matches.push((record.id, record.content));
                }
            })
            .await?;

        let mut message_chats: HashMap<String, (String, String)> = HashMap::new();
        self.ctx
            .chats
            .iterate(&mut |chat: ChatRecord| {
                for message_id in chat.message_ids {
                    message_chats.insert(message_id, (chat.id.clone(), chat.name.clone()));
                }
            })
            .await?;

        let mut hits = Vec::new();
        for (message_id, content) in matches {
            let owner = variation_roots.get(&message_id).unwrap_or(&message_id);
            let Some((chat_id, chat_name)) = message_chats.get(owner) else {
                continue;
            };
            hits.push(SearchHit {
                chat_id: chat_id.clone(),
                chat_name: chat_name.clone(),
                message_id,
                content,
            });
        }

        debug!(query = %query, hits = hits.len(), "Searched messages");
        Ok(hits)
    }
}
