//! Fan-out coordinator.
//!
//! Synchronous submissions call both targets on independent tasks and join
//! on both; asynchronous submissions publish one dispatch message and return
//! straight away. Either way the request record exists before any target is
//! contacted, and every outcome goes through the [`CompletionRouter`].

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::aggregate::{Applied, RequestAggregate};
use crate::dispatch::DispatchPublisher;
use crate::error::{ReportError, Result};
use crate::report::{DispatchMessage, Outcome, ReportPayload, ReportRequest, TargetKind};
use crate::router::CompletionRouter;
use crate::target::{self, TargetClient};

/// Description prefixes recording the delivery mode.
pub const SYNC_PREFIX: &str = "Sync - ";
pub const ASYNC_PREFIX: &str = "Async - ";

/// Permits one synchronous request holds while both targets run.
pub const TARGETS_PER_REQUEST: u32 = 2;

/// The two generation targets.
#[derive(Clone)]
pub struct Targets {
    pub pdf: Arc<dyn TargetClient>,
    pub excel: Arc<dyn TargetClient>,
}

impl Targets {
    pub fn get(&self, kind: TargetKind) -> &Arc<dyn TargetClient> {
        match kind {
            TargetKind::Pdf => &self.pdf,
            TargetKind::Excel => &self.excel,
        }
    }
}

pub struct FanOutCoordinator {
    router: Arc<CompletionRouter>,
    targets: Targets,
    publisher: Arc<dyn DispatchPublisher>,
    permits: Arc<Semaphore>,
    target_timeout: Duration,
}

impl FanOutCoordinator {
    /// `permits` bounds concurrent target calls across all requests and must
    /// hold at least [`TARGETS_PER_REQUEST`] permits.
    pub fn new(
        router: Arc<CompletionRouter>,
        targets: Targets,
        publisher: Arc<dyn DispatchPublisher>,
        permits: Arc<Semaphore>,
        target_timeout: Duration,
    ) -> Self {
        Self {
            router,
            targets,
            publisher,
            permits,
            target_timeout,
        }
    }

    pub fn aggregate(&self) -> &Arc<RequestAggregate> {
        self.router.aggregate()
    }

    /// Creates the request, runs both targets concurrently and returns once
    /// both sub-reports have settled.
    ///
    /// Target failures end up as FAILED sub-reports. Errors applying an
    /// outcome (the request was deleted mid-flight, storage failure) are
    /// returned.
    pub async fn submit_sync(&self, payload: ReportPayload) -> Result<ReportRequest> {
        payload.validate()?;
        let description = format!("{}{}", SYNC_PREFIX, payload.description);
        let request = self
            .aggregate()
            .create(&description, &payload.submitter)?;

        let span = tracing::info_span!("fan_out", request_id = %request.id, mode = "sync");
        self.fan_out(&request.id, payload).instrument(span).await
    }

    async fn fan_out(&self, request_id: &str, payload: ReportPayload) -> Result<ReportRequest> {
        let message = Arc::new(DispatchMessage::new(request_id, payload));

        // Both permits at once, so the two calls of one request never queue
        // behind each other.
        let permits = match Arc::clone(&self.permits)
            .acquire_many_owned(TARGETS_PER_REQUEST)
            .await
        {
            Ok(permits) => Arc::new(permits),
            Err(_) => {
                for kind in TargetKind::ALL {
                    self.router
                        .apply(request_id, kind, Outcome::failed(target::SHUT_DOWN_REASON))
                        .await?;
                }
                return self.aggregate().get(request_id);
            }
        };

        let pdf = self.spawn_target(TargetKind::Pdf, Arc::clone(&message), Arc::clone(&permits));
        let excel = self.spawn_target(TargetKind::Excel, Arc::clone(&message), permits);

        let (pdf, excel) = tokio::join!(pdf, excel);
        let pdf = settle(request_id, TargetKind::Pdf, pdf);
        let excel = settle(request_id, TargetKind::Excel, excel);
        pdf?;
        excel?;

        let settled = self.aggregate().get(request_id)?;
        info!(
            "Request {} settled: PDF {}, EXCEL {}",
            settled.id,
            settled.pdf_target().status(),
            settled.excel_target().status()
        );
        Ok(settled)
    }

    fn spawn_target(
        &self,
        kind: TargetKind,
        message: Arc<DispatchMessage>,
        permits: Arc<OwnedSemaphorePermit>,
    ) -> JoinHandle<Result<Applied>> {
        let client = Arc::clone(self.targets.get(kind));
        let router = Arc::clone(&self.router);
        let timeout = self.target_timeout;
        let in_flight = self.router.track(&message.request_id, kind);
        let span = tracing::info_span!("target", request_id = %message.request_id, kind = %kind);

        tokio::spawn(
            async move {
                let _permits = permits;
                let _in_flight = in_flight;
                let outcome = target::call(client.as_ref(), &message, timeout).await;
                router.apply(&message.request_id, kind, outcome).await
            }
            .instrument(span),
        )
    }

    /// Creates the request and publishes it to the targets without waiting.
    ///
    /// The returned request has both sub-reports PENDING. If nothing is
    /// listening on the dispatch channel both sub-reports are failed and
    /// `Dispatch` is returned.
    pub async fn submit_async(&self, payload: ReportPayload) -> Result<ReportRequest> {
        payload.validate()?;
        let description = format!("{}{}", ASYNC_PREFIX, payload.description);
        let request = self
            .aggregate()
            .create(&description, &payload.submitter)?;

        self.publish(&request.id, payload)
            .instrument(tracing::info_span!("fan_out", request_id = %request.id, mode = "async"))
            .await?;
        Ok(request)
    }

    /// Resets both sub-reports of an existing request to PENDING and
    /// dispatches it again.
    pub async fn regenerate(
        &self,
        request_id: &str,
        payload: ReportPayload,
    ) -> Result<ReportRequest> {
        payload.validate()?;
        let request = self
            .aggregate()
            .reset_for_regeneration(request_id, &payload.submitter)?;

        self.publish(&request.id, payload)
            .instrument(tracing::info_span!("regenerate", request_id = %request.id))
            .await?;
        Ok(request)
    }

    async fn publish(&self, request_id: &str, payload: ReportPayload) -> Result<()> {
        let e = match self
            .publisher
            .publish(DispatchMessage::new(request_id, payload))
        {
            Ok(_) => {
                info!("Dispatched request {} to the generation targets", request_id);
                return Ok(());
            }
            Err(e) => e,
        };

        error!("Failed to dispatch request {}: {}", request_id, e);
        for kind in TargetKind::ALL {
            self.router
                .apply(request_id, kind, Outcome::failed(e.to_string()))
                .await?;
        }
        Err(ReportError::Dispatch {
            request_id: request_id.to_string(),
            reason: e.to_string(),
        })
    }
}

fn settle(
    request_id: &str,
    kind: TargetKind,
    joined: std::result::Result<Result<Applied>, tokio::task::JoinError>,
) -> Result<Applied> {
    joined.map_err(|e| ReportError::TaskJoin {
        request_id: request_id.to_string(),
        kind,
        reason: e.to_string(),
    })?
}
