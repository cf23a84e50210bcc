use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::models::MessageView;

/// Incremental text chunks of one chat completion.
pub type ChunkStream = BoxStream<'static, anyhow::Result<String>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Ollama,
    LmStudio,
    OpenAiCompatible,
    ImageGeneration,
    InBrowser,
}

impl BackendKind {
    pub fn display_name(&self) -> &str {
        match self {
            BackendKind::Ollama => "Ollama",
            BackendKind::LmStudio => "LM Studio",
            BackendKind::OpenAiCompatible => "OpenAI compatible",
            BackendKind::ImageGeneration => "Image generation",
            BackendKind::InBrowser => "In-browser model",
        }
    }

    pub fn is_image_generation(&self) -> bool {
        matches!(self, BackendKind::ImageGeneration)
    }
}

/// One configured connection plus the model selected on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub name: String,
    pub kind: BackendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl BackendConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            base_url: None,
            model: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation token shared between the orchestrator and one
/// in-flight adapter call.
#[derive(Clone, Default)]
pub struct CancelFlag {
    state: Arc<CancelState>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelFlag")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Uniform contract over a concrete model provider.
///
/// Streams returned by `generate_chat` must end with an error promptly once
/// `cancel` fires (or `cancel_generation` is called for the target id), and
/// must simply end on natural completion.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    async fn generate_chat(
        &self,
        history: Vec<Arc<MessageView>>,
        target: Arc<MessageView>,
        cancel: CancelFlag,
    ) -> anyhow::Result<ChunkStream>;

    /// Image payloads (data URLs or remote references) for `prompt`.
    async fn generate_images(
        &self,
        prompt: String,
        target: Arc<MessageView>,
        cancel: CancelFlag,
    ) -> anyhow::Result<Vec<String>>;

    /// Cancel the in-flight call for message `id`, or every call when `None`.
    fn cancel_generation(&self, id: Option<&str>);
}

struct RegisteredBackend {
    config: BackendConfig,
    adapter: Arc<dyn BackendAdapter>,
}

/// Configured backends and the one currently active.
#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<Vec<RegisteredBackend>>,
    active_id: RwLock<Option<String>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a backend. The first one registered becomes active.
    pub fn register(&self, config: BackendConfig, adapter: Arc<dyn BackendAdapter>) {
        let id = config.id.clone();
        {
            let mut backends = self.backends.write();
            backends.retain(|b| b.config.id != id);
            backends.push(RegisteredBackend { config, adapter });
        }

        let mut active = self.active_id.write();
        if active.is_none() {
            *active = Some(id);
        }
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = {
            let mut backends = self.backends.write();
            let before = backends.len();
            backends.retain(|b| b.config.id != id);
            backends.len() != before
        };

        let mut active = self.active_id.write();
        if active.as_deref() == Some(id) {
            *active = self.backends.read().first().map(|b| b.config.id.clone());
        }
        removed
    }

    pub fn set_active(&self, id: &str) -> bool {
        if self.backends.read().iter().any(|b| b.config.id == id) {
            debug!(backend_id = %id, "Switching active backend");
            *self.active_id.write() = Some(id.to_string());
            true
        } else {
            false
        }
    }

    pub fn active_id(&self) -> Option<String> {
        self.active_id.read().clone()
    }

    pub fn active(&self) -> Option<(BackendConfig, Arc<dyn BackendAdapter>)> {
        let id = self.active_id()?;
        self.get(&id)
    }

    pub fn get(&self, id: &str) -> Option<(BackendConfig, Arc<dyn BackendAdapter>)> {
        self.backends
            .read()
            .iter()
            .find(|b| b.config.id == id)
            .map(|b| (b.config.clone(), b.adapter.clone()))
    }

    pub fn configs(&self) -> Vec<BackendConfig> {
        self.backends.read().iter().map(|b| b.config.clone()).collect()
    }

    pub fn adapters(&self) -> Vec<Arc<dyn BackendAdapter>> {
        self.backends.read().iter().map(|b| b.adapter.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedBackend;
    use std::time::Duration;

    #[test]
    fn test_first_registered_is_active() {
        let registry = BackendRegistry::new();
        registry.register(
            BackendConfig::new("ollama", "Local", BackendKind::Ollama),
            Arc::new(ScriptedBackend::new()),
        );
        registry.register(
            BackendConfig::new("sd", "Images", BackendKind::ImageGeneration),
            Arc::new(ScriptedBackend::new()),
        );

        assert_eq!(registry.active_id().as_deref(), Some("ollama"));
        assert!(registry.set_active("sd"));
        assert!(registry.active().unwrap().0.kind.is_image_generation());
        assert!(!registry.set_active("missing"));
    }

    #[test]
    fn test_unregister_active_falls_back() {
        let registry = BackendRegistry::new();
        registry.register(
            BackendConfig::new("a", "A", BackendKind::Ollama),
            Arc::new(ScriptedBackend::new()),
        );
        registry.register(
            BackendConfig::new("b", "B", BackendKind::LmStudio),
            Arc::new(ScriptedBackend::new()),
        );

        assert!(registry.unregister("a"));
        assert_eq!(registry.active_id().as_deref(), Some("b"));
        assert!(registry.unregister("b"));
        assert!(registry.active().is_none());
    }

    #[tokio::test]
    async fn test_cancel_flag_wakes_waiters() {
        let flag = CancelFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.cancelled().await })
        };

        tokio::task::yield_now().await;
        assert!(!flag.is_cancelled());
        flag.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let flag = CancelFlag::new();
        flag.cancel();
        flag.cancelled().await;
    }
}
