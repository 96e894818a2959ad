//! Target client boundary.
//!
//! A target is a black box that turns a [`DispatchMessage`] into a generated
//! file. The rest of the crate calls one only through [`invoke`] (which
//! takes a concurrency permit first) or [`call`] (for callers already holding
//! one). Both enforce the per-call timeout and contain panics, so every call
//! resolves to an [`Outcome`] and never to an error or a hang.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::report::{DispatchMessage, Outcome, TargetKind, MAX_FILE_SIZE};

/// Maximum length of an error body kept in a failure reason.
const MAX_ERROR_BODY_LENGTH: usize = 200;

/// Failure reason when the permit semaphore has been closed.
pub const SHUT_DOWN_REASON: &str = "target dispatch is shut down";

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Request to {kind} target failed: {message}")]
    Transport { kind: TargetKind, message: String },

    #[error("{kind} target returned HTTP {status}: {body}")]
    Status {
        kind: TargetKind,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {kind} target: {message}")]
    InvalidResponse { kind: TargetKind, message: String },
}

/// Response body of a generation target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResponse {
    pub request_id: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TargetResponse {
    pub fn success(request_id: &str, file_ref: &str, file_size: u64) -> Self {
        Self {
            request_id: request_id.to_string(),
            succeeded: true,
            file_ref: Some(file_ref.to_string()),
            file_size: Some(file_size),
            error: None,
        }
    }

    pub fn failure(request_id: &str, error: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            succeeded: false,
            file_ref: None,
            file_size: None,
            error: Some(error.to_string()),
        }
    }

    /// Maps the response onto an outcome for the request that was dispatched.
    ///
    /// A response for a different request, or a success without a file, is
    /// a failure.
    pub fn into_outcome(self, expected_request_id: &str) -> Outcome {
        if self.request_id != expected_request_id {
            return Outcome::failed(format!(
                "response names request '{}' instead of '{}'",
                self.request_id, expected_request_id
            ));
        }
        if !self.succeeded {
            return Outcome::Failed {
                reason: Some(
                    self.error
                        .unwrap_or_else(|| "target reported failure".to_string()),
                ),
            };
        }
        match (self.file_ref, self.file_size) {
            (Some(_), Some(file_size)) if file_size > MAX_FILE_SIZE => Outcome::failed(format!(
                "target reported file size {} above the supported maximum",
                file_size
            )),
            (Some(file_ref), Some(file_size)) if !file_ref.trim().is_empty() => {
                Outcome::succeeded(file_ref, file_size)
            }
            _ => Outcome::failed("target reported success without fileRef/fileSize"),
        }
    }
}

/// One generation target.
#[async_trait]
pub trait TargetClient: Send + Sync {
    fn kind(&self) -> TargetKind;

    async fn generate(&self, message: &DispatchMessage) -> Result<TargetResponse, TargetError>;
}

/// Target reached over HTTP: POSTs the dispatch message as JSON and expects
/// a [`TargetResponse`] back.
pub struct HttpTargetClient {
    kind: TargetKind,
    client: Client,
    endpoint: String,
}

impl HttpTargetClient {
    pub fn new(
        kind: TargetKind,
        base_url: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<Self, TargetError> {
        let client = Client::builder()
            .user_agent(concat!("reportgen/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| TargetError::Client(e.to_string()))?;

        Ok(Self {
            kind,
            client,
            endpoint: join_url(base_url, path),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &body[..end])
}

#[async_trait]
impl TargetClient for HttpTargetClient {
    fn kind(&self) -> TargetKind {
        self.kind
    }

    async fn generate(&self, message: &DispatchMessage) -> Result<TargetResponse, TargetError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(message)
            .send()
            .await
            .map_err(|e| TargetError::Transport {
                kind: self.kind,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TargetError::Status {
                kind: self.kind,
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        response
            .json::<TargetResponse>()
            .await
            .map_err(|e| TargetError::InvalidResponse {
                kind: self.kind,
                message: e.to_string(),
            })
    }
}

/// Calls one target and settles the result into an outcome.
///
/// Waits for a permit first; the timeout covers only the call itself.
pub async fn invoke(
    client: &dyn TargetClient,
    message: &DispatchMessage,
    permits: &Semaphore,
    timeout: Duration,
) -> Outcome {
    let _permit = match permits.acquire().await {
        Ok(permit) => permit,
        Err(_) => return Outcome::failed(SHUT_DOWN_REASON),
    };
    call(client, message, timeout).await
}

/// Calls one target under a permit the caller already holds.
pub async fn call(client: &dyn TargetClient, message: &DispatchMessage, timeout: Duration) -> Outcome {
    let kind = client.kind();
    debug!("Dispatching request {} to {} target", message.request_id, kind);

    let attempt = AssertUnwindSafe(client.generate(message)).catch_unwind();
    let outcome = match tokio::time::timeout(timeout, attempt).await {
        Err(_) => Outcome::failed(format!("timed out after {:?}", timeout)),
        Ok(Err(_)) => Outcome::failed(format!("{} target client panicked", kind)),
        Ok(Ok(Err(e))) => Outcome::failed(e.to_string()),
        Ok(Ok(Ok(response))) => response.into_outcome(&message.request_id),
    };

    if let Outcome::Failed { reason } = &outcome {
        warn!(
            "{} target failed for request {}: {}",
            kind,
            message.request_id,
            reason.as_deref().unwrap_or("unknown error")
        );
    }
    outcome
}
