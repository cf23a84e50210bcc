//! Shared fakes and fixtures for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::models::{
    ChatContext, ChatRecord, ChatStore, ChatTimeline, MessageContext, MessageRecord, MessageView,
};
use crate::repositories::record_store::RecordVisitor;
use crate::repositories::{
    BoxFuture, InMemoryBlobCache, InMemoryRecordStore, Record, RecordStore,
    RepositoryResult,
};
use crate::services::{
    BackendAdapter, BackendConfig, BackendKind, BackendRegistry, CancelFlag, ChunkStream,
    ConnectionStatus, ConnectivityChecker, ConnectivityMonitor, Notice, Notifier,
};
use crate::settings::CoreSettings;

/// In-memory store that counts writes. It can hold `put`s at a gate, or
/// yield to the scheduler before every operation.
pub struct CountingStore<R: Record> {
    inner: InMemoryRecordStore<R>,
    writes: Arc<AtomicUsize>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    parked: Arc<AtomicUsize>,
    yielding: AtomicBool,
}

impl<R: Record> CountingStore<R> {
    pub fn new() -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            writes: Arc::new(AtomicUsize::new(0)),
            gate: Mutex::new(None),
            parked: Arc::new(AtomicUsize::new(0)),
            yielding: AtomicBool::new(false),
        }
    }

    /// Park every following `put` until `release_writes`.
    pub fn hold_writes(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_writes(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.close();
        }
    }

    /// Number of `put`s that reached a held gate.
    pub fn parked(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }

    pub fn set_yielding(&self, yielding: bool) {
        self.yielding.store(yielding, Ordering::SeqCst);
    }

    fn wrap<T: Send + 'static>(
        &self,
        op: BoxFuture<'static, RepositoryResult<T>>,
    ) -> BoxFuture<'static, RepositoryResult<T>> {
        if !self.yielding.load(Ordering::SeqCst) {
            return op;
        }
        Box::pin(async move {
            tokio::task::yield_now().await;
            op.await
        })
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains(id)
    }
}

impl<R: Record> RecordStore<R> for CountingStore<R> {
    fn create(&self, record: R) -> BoxFuture<'static, RepositoryResult<R>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.wrap(self.inner.create(record))
    }

    fn put(&self, record: R) -> BoxFuture<'static, RepositoryResult<R>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let write = self.wrap(self.inner.put(record));
        let Some(gate) = self.gate.lock().clone() else {
            return write;
        };
        let parked = self.parked.clone();
        Box::pin(async move {
            parked.fetch_add(1, Ordering::SeqCst);
            // Closing the gate releases every waiter.
            let _ = gate.acquire().await;
            write.await
        })
    }

    fn find_by_id(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<R>>> {
        self.wrap(self.inner.find_by_id(id))
    }

    fn find_by_ids(&self, ids: &[String]) -> BoxFuture<'static, RepositoryResult<Vec<R>>> {
        self.wrap(self.inner.find_by_ids(ids))
    }

    fn destroy(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        self.wrap(self.inner.destroy(id))
    }

    fn destroy_many(&self, ids: &[String]) -> BoxFuture<'static, RepositoryResult<()>> {
        self.wrap(self.inner.destroy_many(ids))
    }

    fn iterate<'a>(&'a self, visit: RecordVisitor<'a, R>) -> BoxFuture<'a, RepositoryResult<()>> {
        self.inner.iterate(visit)
    }
}

/// Collects every notice raised.
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().push(notice);
    }
}

/// Connectivity checker answering with a settable status.
pub struct FixedConnectivity {
    status: Mutex<ConnectionStatus>,
    checks: AtomicUsize,
}

impl FixedConnectivity {
    pub fn new(status: ConnectionStatus) -> Self {
        Self {
            status: Mutex::new(status),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityChecker for FixedConnectivity {
    async fn check(&self, _backend: &BackendConfig) -> ConnectionStatus {
        self.checks.fetch_add(1, Ordering::SeqCst);
        *self.status.lock()
    }
}

/// One step of a scripted chat stream.
#[derive(Clone, Debug)]
pub enum Step {
    Chunk(String),
    Fail(String),
    /// Park until cancelled, then fail the way a real adapter does.
    WaitForCancel,
}

/// Backend adapter replaying a fixed script.
#[derive(Default)]
pub struct ScriptedBackend {
    steps: Vec<Step>,
    images: Vec<String>,
    fail_request: Option<String>,
    calls: AtomicUsize,
    histories: Mutex<Vec<Vec<String>>>,
    prompts: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<Option<String>>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_steps(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    /// Stream the given chunks, then end.
    pub fn replying(chunks: &[&str]) -> Self {
        Self::with_steps(chunks.iter().map(|c| Step::Chunk(c.to_string())).collect())
    }

    pub fn with_images(images: Vec<String>) -> Self {
        Self {
            images,
            ..Self::default()
        }
    }

    /// Reject the request before any stream is opened.
    pub fn failing(message: &str) -> Self {
        Self {
            fail_request: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Contents of the history handed to each `generate_chat` call.
    pub fn histories(&self) -> Vec<Vec<String>> {
        self.histories.lock().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<Option<String>> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl BackendAdapter for ScriptedBackend {
    async fn generate_chat(
        &self,
        history: Vec<Arc<MessageView>>,
        _target: Arc<MessageView>,
        cancel: CancelFlag,
    ) -> anyhow::Result<ChunkStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.histories
            .lock()
            .push(history.iter().map(|m| m.content()).collect());
        if let Some(message) = &self.fail_request {
            anyhow::bail!("{}", message);
        }

        let steps = self.steps.clone();
        let stream = async_stream::stream! {
            for step in steps {
                match step {
                    Step::Chunk(chunk) => {
                        tokio::task::yield_now().await;
                        yield Ok(chunk);
                    }
                    Step::Fail(message) => {
                        yield Err(anyhow::anyhow!(message));
                        return;
                    }
                    Step::WaitForCancel => {
                        cancel.cancelled().await;
                        yield Err(anyhow::anyhow!("request aborted"));
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn generate_images(
        &self,
        prompt: String,
        _target: Arc<MessageView>,
        _cancel: CancelFlag,
    ) -> anyhow::Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt);
        if let Some(message) = &self.fail_request {
            anyhow::bail!("{}", message);
        }
        Ok(self.images.clone())
    }

    fn cancel_generation(&self, id: Option<&str>) {
        self.cancelled.lock().push(id.map(str::to_string));
    }
}

/// Fully wired in-memory environment.
pub struct TestEnv {
    pub settings: CoreSettings,
    pub messages: Arc<CountingStore<MessageRecord>>,
    pub chats: Arc<InMemoryRecordStore<ChatRecord>>,
    pub blobs: Arc<InMemoryBlobCache>,
    pub backends: Arc<BackendRegistry>,
    pub connectivity: Arc<FixedConnectivity>,
    pub notifier: Arc<RecordingNotifier>,
    pub ctx: Arc<ChatContext>,
}

impl TestEnv {
    pub fn new() -> Self {
        let settings = CoreSettings::default();
        let messages: Arc<CountingStore<MessageRecord>> = Arc::new(CountingStore::new());
        let chats: Arc<InMemoryRecordStore<ChatRecord>> = Arc::new(InMemoryRecordStore::new());
        let blobs = Arc::new(InMemoryBlobCache::new());
        let backends = Arc::new(BackendRegistry::new());
        let connectivity = Arc::new(FixedConnectivity::new(ConnectionStatus::Online));
        let notifier = Arc::new(RecordingNotifier::default());
        let monitor = Arc::new(ConnectivityMonitor::new(
            connectivity.clone(),
            notifier.clone(),
        ));

        let ctx = ChatContext::new(
            settings.clone(),
            chats.clone(),
            messages.clone(),
            blobs.clone(),
            backends.clone(),
            monitor,
            notifier.clone(),
        );

        Self {
            settings,
            messages,
            chats,
            blobs,
            backends,
            connectivity,
            notifier,
            ctx,
        }
    }

    /// Environment with `adapter` registered as the active text backend.
    pub fn with_backend(adapter: Arc<ScriptedBackend>) -> Self {
        let env = Self::new();
        env.backends.register(
            BackendConfig::new("ollama", "Local Ollama", BackendKind::Ollama)
                .with_base_url("http://localhost:11434")
                .with_model("llama3"),
            adapter,
        );
        env
    }

    pub fn message_ctx(&self) -> Arc<MessageContext> {
        self.ctx.messages.clone()
    }

    pub fn message_view(&self, record: MessageRecord) -> Arc<MessageView> {
        MessageView::new(record, self.message_ctx())
    }

    pub fn chat_store(&self) -> ChatStore {
        ChatStore::new(self.ctx.clone())
    }

    pub async fn new_chat(&self) -> Arc<ChatTimeline> {
        ChatTimeline::new(
            self.chats.create(ChatRecord::new("")).await.unwrap(),
            self.ctx.clone(),
        )
    }

    pub async fn stored_message(&self, id: &str) -> Option<MessageRecord> {
        self.messages.find_by_id(id).await.unwrap()
    }

    pub async fn stored_chat(&self, id: &str) -> Option<ChatRecord> {
        self.chats.find_by_id(id).await.unwrap()
    }

    pub async fn store_blob(&self, data: &[u8]) -> String {
        crate::repositories::store_image(self.blobs.as_ref(), data.to_vec())
            .await
            .unwrap()
    }
}

pub async fn saved_message(env: &TestEnv, record: MessageRecord) -> MessageRecord {
    env.messages.create(record).await.unwrap()
}

/// Let spawned tasks run to their next await point.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Poll `condition` until it holds, yielding to other tasks in between.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}
