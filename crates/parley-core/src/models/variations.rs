//! Sibling-variation navigation for top-level messages.
//!
//! A message slot is `[root, ...variations]` in creation order. The root's
//! record stores the variation ids and which one is selected; `None` selects
//! the root itself.

use std::sync::Arc;

use tracing::{debug, warn};

use super::events::ChatEvent;
use super::message::MessageRecord;
use super::message_view::MessageView;
use crate::repositories::{RepositoryError, RepositoryResult};

impl MessageView {
    /// Top-level view of this slot (`self` unless this is a variation).
    pub fn slot_root(self: &Arc<Self>) -> Arc<MessageView> {
        self.root().unwrap_or_else(|| self.clone())
    }

    /// Materialize views for every stored variation id, keeping any view
    /// already cached.
    pub async fn load_variations(&self) -> RepositoryResult<()> {
        let ids = self.record().variation_ids;
        if ids.is_empty() {
            return Ok(());
        }
        let records = self.ctx.store.find_by_ids(&ids).await?;
        if records.len() != ids.len() {
            warn!(
                message_id = %self.id(),
                expected = ids.len(),
                found = records.len(),
                "Some variations are missing from the store"
            );
        }
        for record in records {
            self.variations.put(record, false);
        }
        Ok(())
    }

    /// Loaded variation views, in creation order.
    pub fn variations(&self) -> Vec<Arc<MessageView>> {
        self.record()
            .variation_ids
            .iter()
            .filter_map(|id| self.variations.get(id))
            .collect()
    }

    pub fn variation_count(&self) -> usize {
        self.record().variation_ids.len()
    }

    /// The variation currently displayed and continued from. A message with
    /// no (selected) variation selects itself.
    pub fn selected_variation(self: &Arc<Self>) -> Arc<MessageView> {
        let root = self.slot_root();
        root.record()
            .selected_variation_id
            .and_then(|id| root.variations.get(&id))
            .unwrap_or(root)
    }

    /// `[root, ...variations]`.
    pub fn slot(self: &Arc<Self>) -> Vec<Arc<MessageView>> {
        let root = self.slot_root();
        let mut all = vec![root.clone()];
        all.extend(root.variations());
        all
    }

    fn selected_index(self: &Arc<Self>) -> (Vec<Arc<MessageView>>, usize) {
        let selected = self.selected_variation();
        let slot = self.slot();
        let index = slot
            .iter()
            .position(|v| Arc::ptr_eq(v, &selected))
            .unwrap_or(0);
        (slot, index)
    }

    /// Neighbor before the selection; `None` at the first entry.
    pub fn previous_variation(self: &Arc<Self>) -> Option<Arc<MessageView>> {
        let (slot, index) = self.selected_index();
        index.checked_sub(1).and_then(|i| slot.get(i).cloned())
    }

    /// Neighbor after the selection; `None` at the last entry.
    pub fn next_variation(self: &Arc<Self>) -> Option<Arc<MessageView>> {
        let (slot, index) = self.selected_index();
        slot.get(index + 1).cloned()
    }

    /// Append an already-created record as a new variation and select it.
    /// The previous selection stays in the list.
    pub async fn add_variation(
        self: &Arc<Self>,
        record: MessageRecord,
    ) -> RepositoryResult<Arc<MessageView>> {
        let root = self.slot_root();
        let variation_id = record.id.clone();
        if variation_id.is_empty() {
            return Err(RepositoryError::validation("variation has not been created"));
        }

        let id = variation_id.clone();
        root.update(move |r| {
            if !r.variation_ids.contains(&id) {
                r.variation_ids.push(id.clone());
            }
            r.selected_variation_id = Some(id);
        })
        .await?;

        let view = root.variations.put(record, true);
        debug!(root_id = %root.id(), variation_id = %variation_id, "Added variation");
        root.ctx.events.emit(ChatEvent::VariationAdded {
            root_id: root.id().to_string(),
            variation_id,
        });
        Ok(view)
    }

    /// Create an empty bot variation in the store and select it.
    pub async fn create_variation(self: &Arc<Self>) -> RepositoryResult<Arc<MessageView>> {
        let record = self
            .ctx
            .store
            .create(MessageRecord::bot_placeholder())
            .await?;
        self.add_variation(record).await
    }

    /// Remove a variation from the slot and destroy it.
    pub async fn remove_variation(self: &Arc<Self>, variation: &Arc<MessageView>) -> RepositoryResult<()> {
        let root = self.slot_root();
        let variation_id = variation.id().to_string();

        let id = variation_id.clone();
        root.update(move |r| {
            r.variation_ids.retain(|v| v != &id);
            if r.selected_variation_id.as_deref() == Some(id.as_str()) {
                r.selected_variation_id = None;
            }
        })
        .await?;

        variation.destroy().await?;
        root.variations.remove(&variation_id);

        root.ctx.events.emit(ChatEvent::VariationRemoved {
            root_id: root.id().to_string(),
            variation_id,
        });
        Ok(())
    }

    /// Select `variation`; `None` (or the root itself) selects the root.
    pub async fn set_variation(self: &Arc<Self>, variation: Option<&Arc<MessageView>>) -> RepositoryResult<()> {
        let root = self.slot_root();
        let selected = variation
            .map(|v| v.id().to_string())
            .filter(|id| id != root.id());

        if let Some(id) = &selected
            && !root.record().variation_ids.contains(id)
        {
            return Err(RepositoryError::validation(format!(
                "{} is not a variation of {}",
                id,
                root.id()
            )));
        }

        let value = selected.clone();
        root.update(move |r| r.selected_variation_id = value).await?;

        root.ctx.events.emit(ChatEvent::VariationSelected {
            root_id: root.id().to_string(),
            selected_id: selected,
        });
        Ok(())
    }
}
