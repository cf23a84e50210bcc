use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::backend::{BackendConfig, BackendKind};
use super::notifier::{Notice, Notifier};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Unknown,
    Online,
    Offline,
}

#[async_trait]
pub trait ConnectivityChecker: Send + Sync {
    async fn check(&self, backend: &BackendConfig) -> ConnectionStatus;
}

/// Health probe over HTTP against the backend's model-listing endpoint.
pub struct HttpConnectivityChecker {
    client: reqwest::Client,
}

impl HttpConnectivityChecker {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Endpoint probed for `backend`; `None` when there is nothing to reach.
    pub fn probe_url(backend: &BackendConfig) -> Option<String> {
        let base = backend.base_url.as_deref()?.trim_end_matches('/');
        let path = match backend.kind {
            BackendKind::Ollama => "/api/tags",
            BackendKind::LmStudio | BackendKind::OpenAiCompatible => "/v1/models",
            BackendKind::ImageGeneration => "/sdapi/v1/sd-models",
            BackendKind::InBrowser => return None,
        };
        Some(format!("{}{}", base, path))
    }
}

#[async_trait]
impl ConnectivityChecker for HttpConnectivityChecker {
    async fn check(&self, backend: &BackendConfig) -> ConnectionStatus {
        let Some(url) = Self::probe_url(backend) else {
            return ConnectionStatus::Online;
        };

        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => ConnectionStatus::Online,
            Ok(response) => {
                debug!(url = %url, status = %response.status(), "Backend probe returned error status");
                ConnectionStatus::Offline
            }
            Err(e) => {
                debug!(url = %url, error = ?e, "Backend probe failed");
                ConnectionStatus::Offline
            }
        }
    }
}

/// Last known reachability per backend. Raises a global notice when a
/// backend goes offline (and when it comes back).
pub struct ConnectivityMonitor {
    checker: Arc<dyn ConnectivityChecker>,
    notifier: Arc<dyn Notifier>,
    statuses: Mutex<HashMap<String, ConnectionStatus>>,
}

impl ConnectivityMonitor {
    pub fn new(checker: Arc<dyn ConnectivityChecker>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            checker,
            notifier,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn status(&self, backend_id: &str) -> ConnectionStatus {
        self.statuses
            .lock()
            .get(backend_id)
            .copied()
            .unwrap_or(ConnectionStatus::Unknown)
    }

    pub async fn recheck(&self, backend: &BackendConfig) -> ConnectionStatus {
        let status = self.checker.check(backend).await;
        let previous = self
            .statuses
            .lock()
            .insert(backend.id.clone(), status)
            .unwrap_or(ConnectionStatus::Unknown);

        match (previous, status) {
            (ConnectionStatus::Offline, ConnectionStatus::Offline) => {}
            (_, ConnectionStatus::Offline) => {
                warn!(backend_id = %backend.id, "Backend went offline");
                self.notifier.notify(Notice::ConnectionLost {
                    backend_id: backend.id.clone(),
                    backend_name: backend.name.clone(),
                });
            }
            (ConnectionStatus::Offline, ConnectionStatus::Online) => {
                info!(backend_id = %backend.id, "Backend reachable again");
                self.notifier.notify(Notice::ConnectionRestored {
                    backend_id: backend.id.clone(),
                    backend_name: backend.name.clone(),
                });
            }
            _ => {}
        }
        status
    }
}
