//! Wiring: builds the store, targets, notifier, router and coordinator from
//! a [`Config`] and starts the background tasks.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::aggregate::RequestAggregate;
use crate::config::Config;
use crate::coordinator::{FanOutCoordinator, Targets};
use crate::db::{request_repo, Database};
use crate::dispatch::{BroadcastDispatcher, TargetWorker};
use crate::error::{ConfigError, Result, StoreError};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::report::{CompletionEvent, ReportStatus, TargetKind};
use crate::router::{CompletionRouter, PendingSweeper};
use crate::store::RequestStore;
use crate::target::{HttpTargetClient, TargetClient};

/// How long `shutdown` waits for queued completion events.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Externally provided collaborators.
pub struct Components {
    pub store: Arc<dyn RequestStore>,
    pub targets: Targets,
    pub notifier: Arc<dyn Notifier>,
}

impl Components {
    /// Builds the SQLite store, HTTP targets and notifier described by the
    /// config.
    pub fn from_config(config: &Config) -> Result<Self> {
        let db = Database::open_configured(config.database.path.as_deref())
            .map_err(StoreError::from)?;
        let pending = request_repo::count_by_status(&db, ReportStatus::Pending)
            .map_err(StoreError::from)?;
        if pending > 0 {
            info!("{} sub-reports still PENDING from a previous run", pending);
        }

        let timeout = Duration::from_secs(config.dispatch.target_timeout_secs);
        let http_target = |kind: TargetKind| -> Result<Arc<dyn TargetClient>> {
            let target = config.targets.get(kind);
            let client = HttpTargetClient::new(kind, &target.base_url, target.path_for(kind), timeout)
                .map_err(|e| ConfigError::InvalidTarget {
                    kind,
                    reason: e.to_string(),
                })?;
            info!("{} target at {}", kind, client.endpoint());
            Ok(Arc::new(client))
        };
        let targets = Targets {
            pdf: http_target(TargetKind::Pdf)?,
            excel: http_target(TargetKind::Excel)?,
        };

        let notifier: Arc<dyn Notifier> = match &config.notification.webhook {
            Some(webhook) => {
                let token = webhook.token_source().resolve_optional().map_err(|e| {
                    ConfigError::Validation {
                        message: format!("Webhook token: {}", e),
                    }
                })?;
                let notifier = WebhookNotifier::new(
                    &webhook.url,
                    token,
                    Duration::from_secs(webhook.timeout_secs),
                )
                .map_err(|e| ConfigError::Validation {
                    message: format!("Webhook notifier: {}", e),
                })?;
                Arc::new(notifier)
            }
            None => Arc::new(LogNotifier),
        };

        Ok(Self {
            store: Arc::new(db),
            targets,
            notifier,
        })
    }
}

/// A running report system.
///
/// Asynchronous dispatches are consumed by one in-process worker per target,
/// whose results re-enter through the completion channel, the same way
/// events from out-of-process targets do.
pub struct ReportSystem {
    coordinator: FanOutCoordinator,
    router: Arc<CompletionRouter>,
    completions: mpsc::Sender<CompletionEvent>,
    sweeper: Option<PendingSweeper>,
    workers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl ReportSystem {
    /// Builds everything from the config. Must be called inside a Tokio
    /// runtime.
    pub fn start(config: &Config) -> Result<Self> {
        let components = Components::from_config(config)?;
        Ok(Self::start_with(config, components))
    }

    /// Starts the system around the given collaborators.
    pub fn start_with(config: &Config, components: Components) -> Self {
        let aggregate = Arc::new(
            RequestAggregate::new(components.store)
                .with_duplicate_policy(config.duplicates.policy),
        );
        let router = Arc::new(CompletionRouter::new(
            aggregate,
            components.notifier,
            config.notification.recipient.clone(),
        ));

        let dispatcher = BroadcastDispatcher::new(config.dispatch.channel_capacity);
        let permits = Arc::new(Semaphore::new(config.dispatch.worker_count));
        let timeout = Duration::from_secs(config.dispatch.target_timeout_secs);
        let (completions, events) = mpsc::channel(config.dispatch.channel_capacity);

        let workers = TargetKind::ALL
            .into_iter()
            .map(|kind| {
                TargetWorker::new(
                    Arc::clone(components.targets.get(kind)),
                    Arc::clone(&permits),
                    timeout,
                )
                .spawn(dispatcher.subscribe(), completions.clone())
            })
            .collect();

        let mut background = vec![Arc::clone(&router).listen(events)];

        let sweeper = config.pending.timeout_secs.map(|timeout_secs| {
            let sweeper = PendingSweeper::new(
                Arc::clone(&router),
                Duration::from_secs(timeout_secs),
                Duration::from_secs(config.pending.sweep_interval_secs),
            );
            background.push(sweeper.start());
            sweeper
        });
        if sweeper.is_none() {
            info!("Stale pending sweep disabled, PENDING sub-reports wait indefinitely");
        }

        let coordinator = FanOutCoordinator::new(
            Arc::clone(&router),
            components.targets,
            Arc::new(dispatcher),
            permits,
            timeout,
        );

        info!(
            "Report system started ({} concurrent target calls, duplicate policy {:?})",
            config.dispatch.worker_count, config.duplicates.policy
        );

        Self {
            coordinator,
            router,
            completions,
            sweeper,
            workers,
            background,
        }
    }

    pub fn coordinator(&self) -> &FanOutCoordinator {
        &self.coordinator
    }

    pub fn router(&self) -> &Arc<CompletionRouter> {
        &self.router
    }

    pub fn aggregate(&self) -> &Arc<RequestAggregate> {
        self.router.aggregate()
    }

    /// Sender for completion events delivered from outside the process.
    pub fn completion_sender(&self) -> mpsc::Sender<CompletionEvent> {
        self.completions.clone()
    }

    /// Stops the sweeper and workers, then drains queued completion events.
    pub async fn shutdown(self) {
        info!("Shutting down report system...");
        if let Some(sweeper) = &self.sweeper {
            sweeper.stop();
        }
        for worker in self.workers {
            worker.abort();
            let _ = worker.await;
        }
        drop(self.completions);
        drop(self.coordinator);

        for task in self.background {
            match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!("Background task failed: {}", e),
                Err(_) => warn!("Background task did not stop within {:?}", DRAIN_TIMEOUT),
            }
        }
        debug!("Report system stopped");
    }
}
