//! Test harness for isolated orchestration tests.
//!
//! `TestHarness` wires a real aggregate, router and coordinator around
//! scripted targets and a recording notifier, over either the in-memory
//! store or a SQLite database in a temp directory.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{Barrier, Notify, Semaphore};

use reportgen::{
    BroadcastDispatcher, CompletionRouter, Database, DispatchMessage, FanOutCoordinator,
    InMemoryRequestStore, Notification, Notifier, NotifyError, RequestAggregate, RequestStore,
    TargetClient, TargetError, TargetKind, TargetResponse, Targets,
};

/// What a scripted target answers.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed { file_ref: String, file_size: u64 },
    Report(String),
    Error(String),
}

/// Target with a fixed answer, an optional delay, an optional gate that
/// holds the answer back until released and an optional barrier shared with
/// the other target.
pub struct ScriptedTarget {
    kind: TargetKind,
    script: Script,
    delay: Duration,
    gate: Option<Arc<Notify>>,
    barrier: Option<Arc<Barrier>>,
    calls: AtomicUsize,
}

impl ScriptedTarget {
    pub fn succeeding(kind: TargetKind, file_ref: &str, file_size: u64) -> Self {
        Self::new(
            kind,
            Script::Succeed {
                file_ref: file_ref.to_string(),
                file_size,
            },
        )
    }

    /// Answers with an explicit `succeeded: false` response.
    pub fn reporting_failure(kind: TargetKind, reason: &str) -> Self {
        Self::new(kind, Script::Report(reason.to_string()))
    }

    /// Fails at the transport level.
    pub fn erroring(kind: TargetKind, reason: &str) -> Self {
        Self::new(kind, Script::Error(reason.to_string()))
    }

    fn new(kind: TargetKind, script: Script) -> Self {
        Self {
            kind,
            script,
            delay: Duration::ZERO,
            gate: None,
            barrier: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Holds every answer until `gate.notify_one()` is called.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Answers only once every party of `barrier` has been called.
    pub fn meeting_at(mut self, barrier: Arc<Barrier>) -> Self {
        self.barrier = Some(barrier);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetClient for ScriptedTarget {
    fn kind(&self) -> TargetKind {
        self.kind
    }

    async fn generate(&self, message: &DispatchMessage) -> Result<TargetResponse, TargetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.script {
            Script::Succeed {
                file_ref,
                file_size,
            } => Ok(TargetResponse::success(
                &message.request_id,
                file_ref,
                *file_size,
            )),
            Script::Report(reason) => Ok(TargetResponse::failure(&message.request_id, reason)),
            Script::Error(reason) => Err(TargetError::Transport {
                kind: self.kind,
                message: reason.clone(),
            }),
        }
    }
}

/// Notifier that records every notification, optionally failing each one.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        if self.fail {
            return Err(NotifyError::Transport("mail relay unavailable".to_string()));
        }
        Ok(())
    }
}

/// Which store backs the harness.
pub enum Backend {
    Memory,
    Sqlite,
}

pub struct TestHarness {
    /// Keeps the SQLite file alive for the harness lifetime.
    _temp_dir: Option<TempDir>,
    pub pdf: Arc<ScriptedTarget>,
    pub excel: Arc<ScriptedTarget>,
    pub notifier: Arc<RecordingNotifier>,
    pub dispatcher: BroadcastDispatcher,
    pub router: Arc<CompletionRouter>,
    pub coordinator: FanOutCoordinator,
}

impl TestHarness {
    pub fn new(pdf: ScriptedTarget, excel: ScriptedTarget) -> Self {
        Self::build(Backend::Memory, pdf, excel, RecordingNotifier::default())
    }

    pub fn build(
        backend: Backend,
        pdf: ScriptedTarget,
        excel: ScriptedTarget,
        notifier: RecordingNotifier,
    ) -> Self {
        let (temp_dir, store): (Option<TempDir>, Arc<dyn RequestStore>) = match backend {
            Backend::Memory => (None, Arc::new(InMemoryRequestStore::new())),
            Backend::Sqlite => {
                let dir = TempDir::new().expect("Failed to create temp directory");
                let db = Database::open(&dir.path().join("reportgen.db"))
                    .expect("Failed to open database");
                (Some(dir), Arc::new(db))
            }
        };

        let pdf = Arc::new(pdf);
        let excel = Arc::new(excel);
        let notifier = Arc::new(notifier);
        let aggregate = Arc::new(RequestAggregate::new(store));
        let router = Arc::new(CompletionRouter::new(
            aggregate,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            "reports@example.com",
        ));
        let dispatcher = BroadcastDispatcher::new(16);
        let coordinator = FanOutCoordinator::new(
            Arc::clone(&router),
            Targets {
                pdf: Arc::clone(&pdf) as Arc<dyn TargetClient>,
                excel: Arc::clone(&excel) as Arc<dyn TargetClient>,
            },
            Arc::new(dispatcher.clone()),
            Arc::new(Semaphore::new(4)),
            Duration::from_secs(2),
        );

        Self {
            _temp_dir: temp_dir,
            pdf,
            excel,
            notifier,
            dispatcher,
            router,
            coordinator,
        }
    }

    pub fn aggregate(&self) -> &Arc<RequestAggregate> {
        self.router.aggregate()
    }
}

/// Polls `check` until it returns true or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
