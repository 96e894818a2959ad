pub mod aggregate;
pub mod app;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod notify;
pub mod report;
pub mod router;
pub mod secrets;
pub mod store;
pub mod target;
pub mod telemetry;

#[cfg(test)]
mod http_stub;

pub use aggregate::{Applied, RequestAggregate};
pub use app::{Components, ReportSystem};
pub use config::{load_config, Config};
pub use coordinator::{FanOutCoordinator, Targets};
pub use db::Database;
pub use dispatch::{BroadcastDispatcher, DispatchError, DispatchPublisher, TargetWorker};
pub use error::{ConfigError, ReportError, Result, StoreError};
pub use notify::{LogNotifier, NoopNotifier, Notification, Notifier, NotifyError, OutcomeKind};
pub use report::{
    ArtifactRef, CompletionEvent, DispatchMessage, DuplicatePolicy, Outcome, ReportPayload,
    ReportRequest, ReportStatus, SubReport, TargetKind, Transition, MAX_FILE_SIZE,
};
pub use router::{CompletionRouter, PendingSweeper};
pub use secrets::{SecretError, SecretSource};
pub use store::{InMemoryRequestStore, RequestStore};
pub use target::{HttpTargetClient, TargetClient, TargetError, TargetResponse};
pub use telemetry::{init_logging, TelemetryError};
