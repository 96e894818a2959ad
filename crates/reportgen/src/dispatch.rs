//! Asynchronous dispatch broadcast.
//!
//! One message per request goes out on a shared channel; each target
//! consumes it independently and reports back with a [`CompletionEvent`].

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::Instrument;

use crate::report::{CompletionEvent, DispatchMessage, TargetKind};
use crate::target::{self, TargetClient};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No target is subscribed to the dispatch channel")]
    NoSubscribers,
}

/// Publishes dispatch messages to the targets.
pub trait DispatchPublisher: Send + Sync {
    /// Returns how many consumers received the message.
    fn publish(&self, message: DispatchMessage) -> Result<usize, DispatchError>;
}

/// In-process broadcast channel shared by all target consumers.
#[derive(Clone)]
pub struct BroadcastDispatcher {
    sender: broadcast::Sender<Arc<DispatchMessage>>,
}

impl BroadcastDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DispatchMessage>> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastDispatcher {
    fn default() -> Self {
        Self::new(64)
    }
}

impl DispatchPublisher for BroadcastDispatcher {
    fn publish(&self, message: DispatchMessage) -> Result<usize, DispatchError> {
        let request_id = message.request_id.clone();
        let delivered = self
            .sender
            .send(Arc::new(message))
            .map_err(|_| DispatchError::NoSubscribers)?;
        debug!("Published request {} to {} targets", request_id, delivered);
        Ok(delivered)
    }
}

/// Consumes dispatch messages for one target and turns each call into a
/// completion event.
pub struct TargetWorker {
    client: Arc<dyn TargetClient>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl TargetWorker {
    pub fn new(client: Arc<dyn TargetClient>, permits: Arc<Semaphore>, timeout: Duration) -> Self {
        Self {
            client,
            permits,
            timeout,
        }
    }

    /// Runs until the dispatch channel or the completion channel closes,
    /// then waits for the calls it started.
    ///
    /// Each message is handled on its own task; the shared semaphore bounds
    /// how many target calls are in flight. Aborting the returned handle
    /// aborts those calls too.
    pub fn spawn(
        self,
        mut messages: broadcast::Receiver<Arc<DispatchMessage>>,
        completions: mpsc::Sender<CompletionEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let kind = self.client.kind();
            let mut calls = JoinSet::new();
            debug!("{} target worker started", kind);

            loop {
                let received = tokio::select! {
                    Some(finished) = calls.join_next(), if !calls.is_empty() => {
                        log_finished(kind, finished);
                        continue;
                    }
                    received = messages.recv() => received,
                };

                let message = match received {
                    Ok(message) => message,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "{} target worker fell behind, skipped {} dispatch messages",
                            kind, skipped
                        );
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                if completions.is_closed() {
                    break;
                }

                let client = Arc::clone(&self.client);
                let permits = Arc::clone(&self.permits);
                let completions = completions.clone();
                let timeout = self.timeout;
                let span = tracing::info_span!(
                    "target",
                    request_id = %message.request_id,
                    kind = %kind
                );

                calls.spawn(
                    async move {
                        let outcome =
                            target::invoke(client.as_ref(), &message, &permits, timeout).await;
                        let event =
                            CompletionEvent::from_outcome(&message.request_id, kind, outcome);
                        if completions.send(event).await.is_err() {
                            warn!(
                                "Completion channel closed, dropped {} result for {}",
                                kind, message.request_id
                            );
                        }
                    }
                    .instrument(span),
                );
            }

            while let Some(finished) = calls.join_next().await {
                log_finished(kind, finished);
            }
            debug!("{} target worker stopped", kind);
        })
    }
}

fn log_finished(kind: TargetKind, finished: Result<(), JoinError>) {
    if let Err(e) = finished {
        if !e.is_cancelled() {
            warn!("{} target call task failed: {}", kind, e);
        }
    }
}
