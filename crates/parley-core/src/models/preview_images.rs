use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use super::message_view::MessageView;
use crate::repositories::{BlobCache, RepositoryResult, store_image};

#[derive(Clone, Debug, PartialEq, Eq)]
struct PreviewImage {
    reference: String,
    /// Already referenced by a stored message; never deleted from here.
    committed: bool,
}

/// Attachments staged in the composer before a message is sent (or while a
/// sent message is being edited).
pub struct PreviewImageHandler {
    blobs: Arc<dyn BlobCache>,
    images: Mutex<Vec<PreviewImage>>,
}

impl PreviewImageHandler {
    pub fn new(blobs: Arc<dyn BlobCache>) -> Self {
        Self {
            blobs,
            images: Mutex::new(Vec::new()),
        }
    }

    /// Stage raw image bytes; returns the blob reference.
    pub async fn add(&self, data: Vec<u8>) -> RepositoryResult<String> {
        let reference = store_image(self.blobs.as_ref(), data).await?;
        self.images.lock().push(PreviewImage {
            reference: reference.clone(),
            committed: false,
        });
        Ok(reference)
    }

    pub fn images(&self) -> Vec<String> {
        self.images
            .lock()
            .iter()
            .map(|i| i.reference.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.images.lock().is_empty()
    }

    /// Unstage an image, deleting its blob unless a stored message owns it.
    pub async fn remove(&self, reference: &str) -> RepositoryResult<()> {
        let removed = {
            let mut images = self.images.lock();
            let position = images.iter().position(|i| i.reference == reference);
            position.map(|p| images.remove(p))
        };

        if let Some(image) = removed
            && !image.committed
        {
            self.blobs.delete(&image.reference).await?;
        }
        Ok(())
    }

    /// Replace the staged set with the images of `message` (edit mode).
    pub async fn load_from_message(&self, message: &MessageView) {
        self.clear().await;
        let loaded = message
            .image_urls()
            .into_iter()
            .map(|reference| PreviewImage {
                reference,
                committed: true,
            })
            .collect();
        *self.images.lock() = loaded;
    }

    /// Whether anything was staged that no stored message owns yet.
    pub fn has_new(&self) -> bool {
        self.images.lock().iter().any(|i| !i.committed)
    }

    /// Hand the images no message owns yet over to a new message. Images of
    /// an edited message stay staged.
    pub fn take_new(&self) -> Vec<String> {
        let mut images = self.images.lock();
        let (new, committed): (Vec<_>, Vec<_>) =
            std::mem::take(&mut *images).into_iter().partition(|i| !i.committed);
        *images = committed;
        new.into_iter().map(|i| i.reference).collect()
    }

    /// Hand every staged reference over to a message being written.
    pub fn take_for_commit(&self) -> Vec<String> {
        std::mem::take(&mut *self.images.lock())
            .into_iter()
            .map(|i| i.reference)
            .collect()
    }

    /// Drop the staged set, deleting blobs no message owns.
    pub async fn clear(&self) {
        let staged = std::mem::take(&mut *self.images.lock());
        for image in staged.into_iter().filter(|i| !i.committed) {
            if let Err(e) = self.blobs.delete(&image.reference).await {
                warn!(reference = %image.reference, error = ?e, "Failed to delete staged image");
            }
        }
    }
}
