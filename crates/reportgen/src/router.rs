//! Completion router.
//!
//! Every outcome, whether it came back from a synchronous target call, an
//! asynchronous completion event or the stale-pending sweep, is applied
//! through [`CompletionRouter`], which then fires the notification.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::aggregate::{Applied, RequestAggregate};
use crate::error::{ReportError, Result};
use crate::notify::{Notification, Notifier, OutcomeKind};
use crate::report::{CompletionEvent, Outcome, ReportRequest, ReportStatus, TargetKind};

type CallKey = (String, TargetKind);

/// Target calls currently running inside this process.
#[derive(Default)]
struct InFlightCalls {
    calls: Mutex<HashSet<CallKey>>,
}

impl InFlightCalls {
    fn lock(&self) -> MutexGuard<'_, HashSet<CallKey>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("In-flight call registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn contains(&self, request_id: &str, kind: TargetKind) -> bool {
        self.lock().contains(&(request_id.to_string(), kind))
    }
}

/// Marks one target call as running until dropped.
pub(crate) struct InFlight {
    registry: Arc<InFlightCalls>,
    key: CallKey,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

pub struct CompletionRouter {
    aggregate: Arc<RequestAggregate>,
    notifier: Arc<dyn Notifier>,
    recipient: String,
    in_flight: Arc<InFlightCalls>,
}

impl CompletionRouter {
    pub fn new(
        aggregate: Arc<RequestAggregate>,
        notifier: Arc<dyn Notifier>,
        recipient: impl Into<String>,
    ) -> Self {
        Self {
            aggregate,
            notifier,
            recipient: recipient.into(),
            in_flight: Arc::default(),
        }
    }

    pub fn aggregate(&self) -> &Arc<RequestAggregate> {
        &self.aggregate
    }

    /// Registers a target call that will report back through `apply`.
    ///
    /// The stale-pending sweep leaves the sub-report alone while the
    /// returned guard is alive.
    pub(crate) fn track(&self, request_id: &str, kind: TargetKind) -> InFlight {
        let key = (request_id.to_string(), kind);
        self.in_flight.lock().insert(key.clone());
        InFlight {
            registry: Arc::clone(&self.in_flight),
            key,
        }
    }

    /// Applies one completion event.
    ///
    /// Unknown requests fail with `RequestNotFound`; a success event without
    /// a file fails with `InvalidEvent`. Neither writes anything.
    pub async fn receive(&self, event: CompletionEvent) -> Result<Applied> {
        let outcome = match event.outcome() {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Rejected completion event: {}", e);
                return Err(e);
            }
        };
        self.apply(&event.request_id, event.target_kind, outcome)
            .await
    }

    pub(crate) async fn apply(
        &self,
        request_id: &str,
        kind: TargetKind,
        outcome: Outcome,
    ) -> Result<Applied> {
        let applied = self
            .aggregate
            .apply_outcome(request_id, kind, outcome)
            .inspect_err(|e| error!("Failed to apply {} outcome for {}: {}", kind, request_id, e))?;
        self.after_apply(&applied, kind).await;
        Ok(applied)
    }

    async fn after_apply(&self, applied: &Applied, kind: TargetKind) {
        if let Some(status) = applied.settled() {
            self.notify(&applied.request, kind, status).await;
        }
    }

    async fn notify(&self, request: &ReportRequest, kind: TargetKind, status: ReportStatus) {
        let Some(outcome) = OutcomeKind::from_status(status) else {
            return;
        };
        let notification = Notification {
            recipient: self.recipient.clone(),
            outcome,
            submitter: request.submitter.clone(),
            request_id: request.id.clone(),
            target_kind: kind,
        };
        if let Err(e) = self.notifier.notify(&notification).await {
            warn!(
                "Notification for {} report of {} failed: {}",
                kind, request.id, e
            );
        }
    }

    /// Consumes completion events until the channel closes.
    pub fn listen(self: Arc<Self>, mut events: mpsc::Receiver<CompletionEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Completion listener started");
            while let Some(event) = events.recv().await {
                // Failures are already logged by `receive`.
                let _ = self.receive(event).await;
            }
            debug!("Completion listener stopped");
        })
    }

    /// Fails every sub-report still PENDING `timeout` after it was created.
    ///
    /// Sub-reports that settle while the sweep runs, and those whose target
    /// call is still running in this process, are left alone. Returns the
    /// number of sub-reports expired.
    pub async fn expire_pending(&self, timeout: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = match chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        {
            Some(cutoff) => cutoff,
            None => return Ok(0),
        };

        let mut expired = 0;
        for (request_id, kind) in self.aggregate.pending_older_than(cutoff)? {
            if self.in_flight.contains(&request_id, kind) {
                debug!(
                    "{} call for {} is still running, not expiring it",
                    kind, request_id
                );
                continue;
            }
            let outcome = Outcome::failed(format!(
                "no completion received within {}s",
                timeout.as_secs()
            ));
            match self.aggregate.apply_if_pending(&request_id, kind, outcome) {
                Ok(applied) => {
                    if applied.settled().is_some() {
                        expired += 1;
                    }
                    self.after_apply(&applied, kind).await;
                }
                Err(ReportError::RequestNotFound(_)) => {
                    debug!("Request {} was deleted before it could expire", request_id);
                }
                Err(e) => return Err(e),
            }
        }

        if expired > 0 {
            warn!("Expired {} stale pending sub-reports", expired);
        }
        Ok(expired)
    }
}

/// Periodically expires stale PENDING sub-reports.
pub struct PendingSweeper {
    router: Arc<CompletionRouter>,
    timeout: Duration,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl PendingSweeper {
    pub fn new(router: Arc<CompletionRouter>, timeout: Duration, interval: Duration) -> Self {
        Self {
            router,
            timeout,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Starts the sweep loop on the current runtime.
    pub fn start(&self) -> JoinHandle<()> {
        let router = Arc::clone(&self.router);
        let shutdown = Arc::clone(&self.shutdown);
        let wake = Arc::clone(&self.wake);
        let timeout = self.timeout;
        let interval = self.interval;

        tokio::spawn(async move {
            info!(
                "Pending sweeper started (timeout {:?}, every {:?})",
                timeout, interval
            );
            let mut timer = tokio::time::interval(interval);
            timer.tick().await; // skip immediate first tick

            loop {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }

                tokio::select! {
                    _ = timer.tick() => {},
                    _ = wake.notified() => {},
                }

                if shutdown.load(Ordering::Acquire) {
                    break;
                }

                if let Err(e) = router.expire_pending(timeout, Utc::now()).await {
                    error!("Pending sweep failed: {}", e);
                }
            }
            debug!("Pending sweeper stopped");
        })
    }

    /// Signals the sweep loop to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyError;
    use crate::store::InMemoryRequestStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Notification>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, n: &Notification) -> std::result::Result<(), NotifyError> {
            self.sent.lock().unwrap().push(n.clone());
            if self.fail {
                return Err(NotifyError::Transport("smtp down".to_string()));
            }
            Ok(())
        }
    }

    fn router(recorder: Arc<Recorder>) -> CompletionRouter {
        let aggregate = Arc::new(RequestAggregate::new(Arc::new(InMemoryRequestStore::new())));
        CompletionRouter::new(aggregate, recorder, "ops@example.com")
    }

    #[tokio::test]
    async fn test_receive_applies_and_notifies() {
        let recorder = Arc::new(Recorder::default());
        let router = router(Arc::clone(&recorder));
        let req = router.aggregate().create("d", "alice").unwrap();

        let event = CompletionEvent::failed(&req.id, TargetKind::Pdf, Some("bad".to_string()));
        let applied = router.receive(event).await.unwrap();
        assert_eq!(applied.request.pdf_target().status(), ReportStatus::Failed);

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].outcome, OutcomeKind::Failed);
        assert_eq!(sent[0].submitter, "alice");
        assert_eq!(sent[0].recipient, "ops@example.com");
    }

    #[tokio::test]
    async fn test_duplicate_event_is_not_renotified() {
        let recorder = Arc::new(Recorder::default());
        let router = router(Arc::clone(&recorder));
        let req = router.aggregate().create("d", "alice").unwrap();
        let event = CompletionEvent::succeeded(
            &req.id,
            TargetKind::Excel,
            crate::report::ArtifactRef::new("s3://b/x", 3),
        );

        router.receive(event.clone()).await.unwrap();
        router.receive(event).await.unwrap();
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_notification_failure_keeps_update() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let router = router(Arc::clone(&recorder));
        let req = router.aggregate().create("d", "alice").unwrap();

        let event = CompletionEvent::succeeded(
            &req.id,
            TargetKind::Pdf,
            crate::report::ArtifactRef::new("s3://b/p", 3),
        );
        assert!(router.receive(event).await.is_ok());
        let stored = router.aggregate().get(&req.id).unwrap();
        assert_eq!(stored.pdf_target().status(), ReportStatus::Completed);
    }

    #[tokio::test]
    async fn test_invalid_and_unknown_events_are_rejected() {
        let recorder = Arc::new(Recorder::default());
        let router = router(Arc::clone(&recorder));
        let req = router.aggregate().create("d", "alice").unwrap();

        let mut broken = CompletionEvent::failed(&req.id, TargetKind::Pdf, None);
        broken.succeeded = true;
        assert!(matches!(
            router.receive(broken).await,
            Err(ReportError::InvalidEvent { .. })
        ));

        let unknown = CompletionEvent::failed("R404", TargetKind::Pdf, None);
        assert!(matches!(
            router.receive(unknown).await,
            Err(ReportError::RequestNotFound(_))
        ));

        assert_eq!(router.aggregate().get(&req.id).unwrap(), req);
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire_pending_fails_only_stale_pending() {
        let recorder = Arc::new(Recorder::default());
        let router = router(Arc::clone(&recorder));
        let req = router.aggregate().create("d", "alice").unwrap();
        router
            .apply(&req.id, TargetKind::Pdf, Outcome::succeeded("b/p", 1))
            .await
            .unwrap();

        let timeout = Duration::from_secs(60);
        assert_eq!(router.expire_pending(timeout, Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(router.expire_pending(timeout, later).await.unwrap(), 1);

        let stored = router.aggregate().get(&req.id).unwrap();
        assert_eq!(stored.pdf_target().status(), ReportStatus::Completed);
        assert_eq!(stored.excel_target().status(), ReportStatus::Failed);
        assert_eq!(
            stored.excel_target().failure_reason(),
            Some("no completion received within 60s")
        );
        assert_eq!(recorder.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_expire_pending_skips_running_calls() {
        let recorder = Arc::new(Recorder::default());
        let router = router(Arc::clone(&recorder));
        let req = router.aggregate().create("d", "alice").unwrap();
        let later = Utc::now() + chrono::Duration::seconds(120);
        let timeout = Duration::from_secs(60);

        let running = router.track(&req.id, TargetKind::Pdf);
        assert_eq!(router.expire_pending(timeout, later).await.unwrap(), 1);
        let stored = router.aggregate().get(&req.id).unwrap();
        assert_eq!(stored.pdf_target().status(), ReportStatus::Pending);
        assert_eq!(stored.excel_target().status(), ReportStatus::Failed);

        drop(running);
        assert_eq!(router.expire_pending(timeout, later).await.unwrap(), 1);
        let stored = router.aggregate().get(&req.id).unwrap();
        assert_eq!(stored.pdf_target().status(), ReportStatus::Failed);
    }

    #[tokio::test]
    async fn test_listen_drains_channel() {
        let recorder = Arc::new(Recorder::default());
        let router = Arc::new(router(Arc::clone(&recorder)));
        let req = router.aggregate().create("d", "alice").unwrap();

        let (tx, rx) = mpsc::channel(4);
        let handle = Arc::clone(&router).listen(rx);
        tx.send(CompletionEvent::failed("R404", TargetKind::Pdf, None))
            .await
            .unwrap();
        tx.send(CompletionEvent::failed(&req.id, TargetKind::Excel, None))
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        let stored = router.aggregate().get(&req.id).unwrap();
        assert_eq!(stored.excel_target().status(), ReportStatus::Failed);
    }

    #[tokio::test]
    async fn test_sweeper_expires_and_stops() {
        let recorder = Arc::new(Recorder::default());
        let router = Arc::new(router(Arc::clone(&recorder)));
        let req = router.aggregate().create("d", "alice").unwrap();

        let sweeper = PendingSweeper::new(
            Arc::clone(&router),
            Duration::ZERO,
            Duration::from_millis(20),
        );
        let handle = sweeper.start();

        let mut settled = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if router.aggregate().get(&req.id).unwrap().is_settled() {
                settled = true;
                break;
            }
        }
        assert!(settled);

        sweeper.stop();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
