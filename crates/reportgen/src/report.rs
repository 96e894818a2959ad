//! Report request data model.
//!
//! A [`ReportRequest`] always owns exactly two [`SubReport`]s, one per
//! [`TargetKind`]. Sub-report fields are private: the only mutation paths
//! are [`SubReport::apply`] (driven by the request aggregate) and the explicit
//! regeneration reset, so the "file reference present iff COMPLETED" invariant
//! holds for every reachable state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ReportError;

/// The two generation targets of a report request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetKind {
    Pdf,
    Excel,
}

impl TargetKind {
    pub const ALL: [TargetKind; 2] = [TargetKind::Pdf, TargetKind::Excel];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Pdf => "PDF",
            TargetKind::Excel => "EXCEL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PDF" => Some(TargetKind::Pdf),
            "EXCEL" => Some(TargetKind::Excel),
            _ => None,
        }
    }

    /// Default endpoint path on the generation service.
    pub fn default_path(&self) -> &'static str {
        match self {
            TargetKind::Pdf => "/pdf",
            TargetKind::Excel => "/excel",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generation status of one sub-report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReportStatus {
    Pending,
    Completed,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "PENDING",
            ReportStatus::Completed => "COMPLETED",
            ReportStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ReportStatus::Pending),
            "COMPLETED" => Some(ReportStatus::Completed),
            "FAILED" => Some(ReportStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReportStatus::Pending)
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Largest file size a sub-report can record; both stores hold sizes as
/// signed 64-bit integers.
pub const MAX_FILE_SIZE: u64 = i64::MAX as u64;

/// Opaque storage locator of a generated file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub file_ref: String,
    pub file_size: u64,
}

impl ArtifactRef {
    pub fn new(file_ref: impl Into<String>, file_size: u64) -> Self {
        Self {
            file_ref: file_ref.into(),
            file_size,
        }
    }

    /// Splits an object-store locator into `(bucket, key)`.
    ///
    /// Accepts `s3://bucket/key` as well as the bare `bucket/key` form.
    /// Returns `None` when either part is empty.
    pub fn bucket_and_key(&self) -> Option<(&str, &str)> {
        let location = self
            .file_ref
            .strip_prefix("s3://")
            .unwrap_or(&self.file_ref);
        let (bucket, key) = location.split_once('/')?;
        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        Some((bucket, key))
    }
}

/// Result of one generation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded(ArtifactRef),
    Failed { reason: Option<String> },
}

impl Outcome {
    pub fn succeeded(file_ref: impl Into<String>, file_size: u64) -> Self {
        Outcome::Succeeded(ArtifactRef::new(file_ref, file_size))
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reason: Some(reason.into()),
        }
    }

    /// The status a pending sub-report settles into.
    pub fn status(&self) -> ReportStatus {
        match self {
            Outcome::Succeeded(_) => ReportStatus::Completed,
            Outcome::Failed { .. } => ReportStatus::Failed,
        }
    }
}

/// How an already-settled sub-report reacts to another outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Terminal states are final; later outcomes are ignored.
    #[default]
    Ignore,
    /// Last write wins: later outcomes overwrite and re-stamp.
    Overwrite,
}

/// What applying an outcome did to a sub-report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The sub-report was written and now has this status.
    Settled(ReportStatus),
    /// The outcome was not applied (sub-report already terminal).
    Unchanged,
}

/// Plain field set of a sub-report, used for persistence and deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubReportParts {
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

/// Generation status for one target kind within a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SubReportParts", into = "SubReportParts")]
pub struct SubReport {
    status: ReportStatus,
    artifact: Option<ArtifactRef>,
    failure_reason: Option<String>,
    created_time: DateTime<Utc>,
    updated_time: DateTime<Utc>,
}

impl SubReport {
    pub fn pending(now: DateTime<Utc>) -> Self {
        Self {
            status: ReportStatus::Pending,
            artifact: None,
            failure_reason: None,
            created_time: now,
            updated_time: now,
        }
    }

    pub fn status(&self) -> ReportStatus {
        self.status
    }

    pub fn artifact(&self) -> Option<&ArtifactRef> {
        self.artifact.as_ref()
    }

    pub fn file_ref(&self) -> Option<&str> {
        self.artifact.as_ref().map(|a| a.file_ref.as_str())
    }

    pub fn file_size(&self) -> Option<u64> {
        self.artifact.as_ref().map(|a| a.file_size)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn created_time(&self) -> DateTime<Utc> {
        self.created_time
    }

    pub fn updated_time(&self) -> DateTime<Utc> {
        self.updated_time
    }

    /// Applies an outcome under the given duplicate policy.
    pub(crate) fn apply(
        &mut self,
        outcome: Outcome,
        now: DateTime<Utc>,
        policy: DuplicatePolicy,
    ) -> Transition {
        if self.status.is_terminal() && policy == DuplicatePolicy::Ignore {
            return Transition::Unchanged;
        }

        match outcome {
            Outcome::Succeeded(artifact) => {
                self.status = ReportStatus::Completed;
                self.artifact = Some(artifact);
                self.failure_reason = None;
            }
            Outcome::Failed { reason } => {
                self.status = ReportStatus::Failed;
                self.artifact = None;
                self.failure_reason = reason;
            }
        }
        self.updated_time = now;
        Transition::Settled(self.status)
    }

    /// Back to PENDING for an explicit regeneration.
    pub(crate) fn reset(&mut self, now: DateTime<Utc>) {
        *self = Self::pending(now);
    }
}

impl TryFrom<SubReportParts> for SubReport {
    type Error = String;

    fn try_from(parts: SubReportParts) -> Result<Self, Self::Error> {
        let artifact = match (parts.status, parts.file_ref, parts.file_size) {
            (ReportStatus::Completed, Some(file_ref), Some(file_size)) => {
                Some(ArtifactRef { file_ref, file_size })
            }
            (ReportStatus::Completed, _, _) => {
                return Err("COMPLETED sub-report requires fileRef and fileSize".to_string())
            }
            (_, None, None) => None,
            (status, _, _) => {
                return Err(format!("{} sub-report must not carry a file", status));
            }
        };

        if parts.failure_reason.is_some() && parts.status != ReportStatus::Failed {
            return Err(format!(
                "{} sub-report must not carry a failure reason",
                parts.status
            ));
        }

        Ok(Self {
            status: parts.status,
            artifact,
            failure_reason: parts.failure_reason,
            created_time: parts.created_time,
            updated_time: parts.updated_time,
        })
    }
}

impl From<SubReport> for SubReportParts {
    fn from(sub: SubReport) -> Self {
        Self {
            status: sub.status,
            file_ref: sub.artifact.as_ref().map(|a| a.file_ref.clone()),
            file_size: sub.artifact.as_ref().map(|a| a.file_size),
            failure_reason: sub.failure_reason,
            created_time: sub.created_time,
            updated_time: sub.updated_time,
        }
    }
}

/// One user-submitted report job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub id: String,
    pub submitter: String,
    pub description: String,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pdf_target: SubReport,
    excel_target: SubReport,
}

impl ReportRequest {
    /// A fresh request with both sub-reports PENDING.
    pub fn new(id: String, submitter: &str, description: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            submitter: submitter.to_string(),
            description: description.to_string(),
            created_time: now,
            updated_time: now,
            pdf_target: SubReport::pending(now),
            excel_target: SubReport::pending(now),
        }
    }

    /// Reassembles a request from persisted parts.
    pub fn from_parts(
        id: String,
        submitter: String,
        description: String,
        created_time: DateTime<Utc>,
        updated_time: DateTime<Utc>,
        pdf_target: SubReport,
        excel_target: SubReport,
    ) -> Self {
        Self {
            id,
            submitter,
            description,
            created_time,
            updated_time,
            pdf_target,
            excel_target,
        }
    }

    pub fn pdf_target(&self) -> &SubReport {
        &self.pdf_target
    }

    pub fn excel_target(&self) -> &SubReport {
        &self.excel_target
    }

    pub fn sub_report(&self, kind: TargetKind) -> &SubReport {
        match kind {
            TargetKind::Pdf => &self.pdf_target,
            TargetKind::Excel => &self.excel_target,
        }
    }

    pub(crate) fn sub_report_mut(&mut self, kind: TargetKind) -> &mut SubReport {
        match kind {
            TargetKind::Pdf => &mut self.pdf_target,
            TargetKind::Excel => &mut self.excel_target,
        }
    }

    /// True once neither sub-report is PENDING.
    pub fn is_settled(&self) -> bool {
        TargetKind::ALL
            .iter()
            .all(|kind| self.sub_report(*kind).status().is_terminal())
    }
}

/// Out-of-band message reporting one target's outcome for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub request_id: String,
    pub target_kind: TargetKind,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompletionEvent {
    pub fn succeeded(request_id: &str, target_kind: TargetKind, artifact: ArtifactRef) -> Self {
        Self {
            request_id: request_id.to_string(),
            target_kind,
            succeeded: true,
            file_ref: Some(artifact.file_ref),
            file_size: Some(artifact.file_size),
            error: None,
        }
    }

    pub fn failed(request_id: &str, target_kind: TargetKind, error: Option<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            target_kind,
            succeeded: false,
            file_ref: None,
            file_size: None,
            error,
        }
    }

    pub fn from_outcome(request_id: &str, target_kind: TargetKind, outcome: Outcome) -> Self {
        match outcome {
            Outcome::Succeeded(artifact) => Self::succeeded(request_id, target_kind, artifact),
            Outcome::Failed { reason } => Self::failed(request_id, target_kind, reason),
        }
    }

    /// Converts the wire form into an [`Outcome`].
    ///
    /// A success without a file reference and size is rejected rather than
    /// recorded as COMPLETED.
    pub fn outcome(&self) -> Result<Outcome, ReportError> {
        if !self.succeeded {
            return Ok(Outcome::Failed {
                reason: self.error.clone(),
            });
        }
        match (&self.file_ref, self.file_size) {
            (Some(_), Some(file_size)) if file_size > MAX_FILE_SIZE => {
                Err(ReportError::InvalidEvent {
                    request_id: self.request_id.clone(),
                    reason: format!("fileSize {} exceeds the supported maximum", file_size),
                })
            }
            (Some(file_ref), Some(file_size)) if !file_ref.trim().is_empty() => {
                Ok(Outcome::succeeded(file_ref.clone(), file_size))
            }
            _ => Err(ReportError::InvalidEvent {
                request_id: self.request_id.clone(),
                reason: "success reported without fileRef/fileSize".to_string(),
            }),
        }
    }
}

/// User-supplied report data, sent to both targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPayload {
    pub submitter: String,
    pub description: String,
    pub headers: Vec<String>,
    #[serde(default)]
    pub data: Vec<Vec<String>>,
}

impl ReportPayload {
    pub fn validate(&self) -> Result<(), ReportError> {
        if self.submitter.trim().is_empty() {
            return Err(ReportError::InvalidPayload(
                "submitter must not be blank".to_string(),
            ));
        }
        if self.description.trim().is_empty() {
            return Err(ReportError::InvalidPayload(
                "description must not be blank".to_string(),
            ));
        }
        if self.headers.is_empty() {
            return Err(ReportError::InvalidPayload(
                "at least one header is required".to_string(),
            ));
        }
        if let Some((index, row)) = self
            .data
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != self.headers.len())
        {
            return Err(ReportError::InvalidPayload(format!(
                "row {} has {} cells, expected {}",
                index,
                row.len(),
                self.headers.len()
            )));
        }
        Ok(())
    }
}

/// Payload plus the minted request id, as delivered to a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMessage {
    pub request_id: String,
    #[serde(flatten)]
    pub payload: ReportPayload,
}

impl DispatchMessage {
    pub fn new(request_id: &str, payload: ReportPayload) -> Self {
        Self {
            request_id: request_id.to_string(),
            payload,
        }
    }
}
