pub mod backend;
pub mod connectivity;
pub mod logging;
pub mod notifier;

pub use backend::{
    BackendAdapter, BackendConfig, BackendKind, BackendRegistry, CancelFlag, ChunkStream,
};
pub use connectivity::{
    ConnectionStatus, ConnectivityChecker, ConnectivityMonitor, HttpConnectivityChecker,
};
pub use logging::init_logging;
pub use notifier::{Notice, Notifier, TracingNotifier};
