//! Request aggregate: the state-machine layer over the request store.
//!
//! `apply_outcome` is the only writer of sub-report status. The synchronous
//! fan-out and the asynchronous completion path both funnel through it, and
//! it touches only the sub-report named by the [`TargetKind`], which is what
//! makes the final state independent of arrival order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info};
use uuid::Uuid;

use crate::error::{ReportError, Result};
use crate::report::{
    ArtifactRef, DuplicatePolicy, Outcome, ReportRequest, ReportStatus, TargetKind, Transition,
    MAX_FILE_SIZE,
};
use crate::store::RequestStore;

/// Result of applying an outcome.
#[derive(Debug, Clone)]
pub struct Applied {
    /// The request as persisted after the call.
    pub request: ReportRequest,
    pub transition: Transition,
}

impl Applied {
    pub fn settled(&self) -> Option<ReportStatus> {
        match self.transition {
            Transition::Settled(status) => Some(status),
            Transition::Unchanged => None,
        }
    }
}

pub struct RequestAggregate {
    store: Arc<dyn RequestStore>,
    policy: DuplicatePolicy,
}

impl RequestAggregate {
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self {
            store,
            policy: DuplicatePolicy::default(),
        }
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn duplicate_policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Creates and persists a request with both sub-reports PENDING.
    pub fn create(&self, description: &str, submitter: &str) -> Result<ReportRequest> {
        let id = format!("Req-{}", Uuid::new_v4());
        let request = ReportRequest::new(id, submitter, description, Utc::now());
        self.store.insert(&request)?;
        info!("Created report request {} for {}", request.id, submitter);
        Ok(request)
    }

    /// Applies one target's outcome to its sub-report.
    ///
    /// Fails with `RequestNotFound` (and writes nothing) for an unknown id,
    /// and with `InvalidEvent` for a file size above [`MAX_FILE_SIZE`].
    pub fn apply_outcome(
        &self,
        request_id: &str,
        kind: TargetKind,
        outcome: Outcome,
    ) -> Result<Applied> {
        self.apply_with_policy(request_id, kind, outcome, self.policy)
    }

    /// Like `apply_outcome`, but never touches a terminal sub-report
    /// regardless of the configured policy.
    pub(crate) fn apply_if_pending(
        &self,
        request_id: &str,
        kind: TargetKind,
        outcome: Outcome,
    ) -> Result<Applied> {
        self.apply_with_policy(request_id, kind, outcome, DuplicatePolicy::Ignore)
    }

    fn apply_with_policy(
        &self,
        request_id: &str,
        kind: TargetKind,
        outcome: Outcome,
        policy: DuplicatePolicy,
    ) -> Result<Applied> {
        if let Outcome::Succeeded(artifact) = &outcome {
            if artifact.file_size > MAX_FILE_SIZE {
                return Err(ReportError::InvalidEvent {
                    request_id: request_id.to_string(),
                    reason: format!("fileSize {} exceeds the supported maximum", artifact.file_size),
                });
            }
        }

        let mut outcome = Some(outcome);
        let mut transition = Transition::Unchanged;

        let updated = self.store.update(request_id, &mut |request| {
            let Some(outcome) = outcome.take() else {
                return false;
            };
            let now = Utc::now();
            transition = request.sub_report_mut(kind).apply(outcome, now, policy);
            match transition {
                Transition::Settled(_) => {
                    request.updated_time = now;
                    true
                }
                Transition::Unchanged => false,
            }
        })?;

        let request = updated.ok_or_else(|| ReportError::RequestNotFound(request_id.to_string()))?;

        match transition {
            Transition::Settled(status) => {
                info!("{} report of {} is now {}", kind, request_id, status)
            }
            Transition::Unchanged => debug!(
                "Ignored {} outcome for {}: already {}",
                kind,
                request_id,
                request.sub_report(kind).status()
            ),
        }

        Ok(Applied {
            request,
            transition,
        })
    }

    pub fn get(&self, request_id: &str) -> Result<ReportRequest> {
        self.store
            .find_by_id(request_id)?
            .ok_or_else(|| ReportError::RequestNotFound(request_id.to_string()))
    }

    /// All requests in insertion order.
    pub fn list(&self) -> Result<Vec<ReportRequest>> {
        Ok(self.store.list()?)
    }

    /// Deletes the request together with both sub-reports.
    pub fn delete(&self, request_id: &str) -> Result<()> {
        if !self.store.delete(request_id)? {
            return Err(ReportError::RequestNotFound(request_id.to_string()));
        }
        info!("Deleted report request {}", request_id);
        Ok(())
    }

    /// Puts both sub-reports back to PENDING ahead of a regeneration.
    pub fn reset_for_regeneration(&self, request_id: &str, submitter: &str) -> Result<ReportRequest> {
        let updated = self.store.update(request_id, &mut |request| {
            let now = Utc::now();
            request.submitter = submitter.to_string();
            request.created_time = now;
            request.updated_time = now;
            for kind in TargetKind::ALL {
                request.sub_report_mut(kind).reset(now);
            }
            true
        })?;

        let request = updated.ok_or_else(|| ReportError::RequestNotFound(request_id.to_string()))?;
        info!("Reset report request {} for regeneration", request_id);
        Ok(request)
    }

    /// The generated file of a COMPLETED sub-report.
    pub fn artifact(&self, request_id: &str, kind: TargetKind) -> Result<ArtifactRef> {
        let request = self.get(request_id)?;
        let sub = request.sub_report(kind);
        sub.artifact()
            .cloned()
            .ok_or_else(|| ReportError::ArtifactNotReady {
                request_id: request_id.to_string(),
                kind,
                status: sub.status(),
            })
    }

    /// Sub-reports still PENDING that were created before `cutoff`.
    pub fn pending_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<(String, TargetKind)>> {
        let mut stale = Vec::new();
        for request in self.store.list()? {
            for kind in TargetKind::ALL {
                let sub = request.sub_report(kind);
                if sub.status() == ReportStatus::Pending && sub.created_time() < cutoff {
                    stale.push((request.id.clone(), kind));
                }
            }
        }
        Ok(stale)
    }
}
