use std::path::PathBuf;
use thiserror::Error;

use crate::report::{ReportStatus, TargetKind};

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Report request '{0}' not found")]
    RequestNotFound(String),

    #[error("Invalid completion event for request '{request_id}': {reason}")]
    InvalidEvent { request_id: String, reason: String },

    #[error("Invalid report payload: {0}")]
    InvalidPayload(String),

    #[error("{kind} report for request '{request_id}' is not ready (status {status})")]
    ArtifactNotReady {
        request_id: String,
        kind: TargetKind,
        status: ReportStatus,
    },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Dispatch failed for request '{request_id}': {reason}")]
    Dispatch { request_id: String, reason: String },

    #[error("{kind} fan-out task for request '{request_id}' did not finish: {reason}")]
    TaskJoin {
        request_id: String,
        kind: TargetKind,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised at the request repository boundary.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Report request '{0}' already exists")]
    DuplicateId(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid {kind} target: {reason}")]
    InvalidTarget { kind: TargetKind, reason: String },
}

pub type Result<T> = std::result::Result<T, ReportError>;
