//! Conversation core for a multi-backend LLM chat client.
//!
//! The crate tracks conversations as ordered lists of messages, where each
//! message slot may hold several alternative completions ("variations").
//! Bot replies are streamed from pluggable backend adapters by the
//! [`GenerationOrchestrator`], which also owns cancellation and terminal
//! outcome classification. All persisted records go through a
//! [`RecordStore`] and are surfaced as identity-mapped views so that every
//! consumer observes the same object for a given id.

pub mod models;
pub mod repositories;
pub mod services;
pub mod settings;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use models::{
    ChatContext, ChatEvent, ChatRecord, ChatStore, ChatTimeline, EditedMessageHandler,
    EntityCache, EventBus, GenerationError, GenerationOrchestrator, GenerationOutcome,
    MessageContext, MessageError, MessageExtras, MessageRecord, MessageView, PreviewImageHandler,
    SearchHit,
};
pub use repositories::{
    BlobCache, InMemoryBlobCache, InMemoryRecordStore, Record, RecordStore, RepositoryError,
    RepositoryResult, SqliteRecordStore,
};
pub use services::{
    BackendAdapter, BackendConfig, BackendKind, BackendRegistry, CancelFlag, ChunkStream,
    ConnectionStatus, ConnectivityChecker, ConnectivityMonitor, HttpConnectivityChecker, Notice,
    Notifier, TracingNotifier, init_logging,
};
pub use settings::CoreSettings;
