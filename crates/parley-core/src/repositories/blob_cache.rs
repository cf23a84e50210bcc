use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;

use super::error::{RepositoryError, RepositoryResult};
use super::record_store::BoxFuture;

/// Prefix of every blob reference minted by this crate.
pub const BLOB_REF_PREFIX: &str = "blob:";

/// Opaque-reference store for image bytes. Message records only ever hold
/// the reference, never the pixels.
pub trait BlobCache: Send + Sync + 'static {
    fn get(&self, reference: &str) -> BoxFuture<'static, RepositoryResult<Option<Vec<u8>>>>;

    fn put(&self, reference: &str, data: Vec<u8>) -> BoxFuture<'static, RepositoryResult<()>>;

    fn delete(&self, reference: &str) -> BoxFuture<'static, RepositoryResult<()>>;
}

/// Fresh reference for a new blob. References are never shared between
/// messages, so destroying a message may delete its blobs unconditionally.
pub fn new_blob_reference() -> String {
    format!("{}{}", BLOB_REF_PREFIX, uuid::Uuid::new_v4())
}

/// Store `data` under a fresh reference and return the reference.
pub async fn store_image(cache: &dyn BlobCache, data: Vec<u8>) -> RepositoryResult<String> {
    let reference = new_blob_reference();
    cache.put(&reference, data).await?;
    Ok(reference)
}

/// Decode an image payload as handed back by an image-generation backend.
///
/// `data:<mime>;base64,<payload>` URLs are decoded; anything else (a remote
/// URL, a raw reference) is kept verbatim.
pub fn decode_image_payload(payload: &str) -> RepositoryResult<Vec<u8>> {
    match payload.strip_prefix("data:") {
        Some(rest) => {
            let (_, encoded) = rest.split_once(";base64,").ok_or_else(|| {
                RepositoryError::validation("data URL is not base64 encoded")
            })?;
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| RepositoryError::validation(format!("invalid base64 image: {}", e)))
        }
        None => Ok(payload.as_bytes().to_vec()),
    }
}

/// In-memory blob cache
#[derive(Clone, Default)]
pub struct InMemoryBlobCache {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryBlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.blobs.lock().contains_key(reference)
    }
}

impl BlobCache for InMemoryBlobCache {
    fn get(&self, reference: &str) -> BoxFuture<'static, RepositoryResult<Option<Vec<u8>>>> {
        let blobs = self.blobs.clone();
        let reference = reference.to_string();
        Box::pin(async move { Ok(blobs.lock().get(&reference).cloned()) })
    }

    fn put(&self, reference: &str, data: Vec<u8>) -> BoxFuture<'static, RepositoryResult<()>> {
        let blobs = self.blobs.clone();
        let reference = reference.to_string();
        Box::pin(async move {
            blobs.lock().insert(reference, data);
            Ok(())
        })
    }

    fn delete(&self, reference: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let blobs = self.blobs.clone();
        let reference = reference.to_string();
        Box::pin(async move {
            blobs.lock().remove(&reference);
            Ok(())
        })
    }
}
