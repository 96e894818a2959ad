//! Builder patterns for creating test data programmatically.

#![allow(dead_code)]

use reportgen::config::{load_config_from_str, Config};
use reportgen::ReportPayload;

/// Builder for `ReportPayload` values.
pub struct PayloadBuilder {
    submitter: String,
    description: String,
    headers: Vec<String>,
    data: Vec<Vec<String>>,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self {
            submitter: "alice".to_string(),
            description: "Quarterly sales".to_string(),
            headers: vec!["region".to_string(), "revenue".to_string()],
            data: vec![
                vec!["north".to_string(), "120".to_string()],
                vec!["south".to_string(), "95".to_string()],
            ],
        }
    }

    pub fn submitter(mut self, submitter: &str) -> Self {
        self.submitter = submitter.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn row(mut self, cells: &[&str]) -> Self {
        self.data.push(cells.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn build(self) -> ReportPayload {
        ReportPayload {
            submitter: self.submitter,
            description: self.description,
            headers: self.headers,
            data: self.data,
        }
    }
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `Config` instances, going through the real loader so schema
/// validation applies.
pub struct ConfigBuilder {
    pdf_url: String,
    excel_url: String,
    database_path: String,
    target_timeout_secs: u64,
    worker_count: Option<usize>,
    pending_timeout_secs: Option<u64>,
    duplicate_policy: String,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            pdf_url: "http://127.0.0.1:9".to_string(),
            excel_url: "http://127.0.0.1:9".to_string(),
            database_path: ":memory:".to_string(),
            target_timeout_secs: 2,
            worker_count: None,
            pending_timeout_secs: None,
            duplicate_policy: "ignore".to_string(),
        }
    }

    pub fn database_path(mut self, path: &str) -> Self {
        self.database_path = path.to_string();
        self
    }

    pub fn target_timeout_secs(mut self, secs: u64) -> Self {
        self.target_timeout_secs = secs;
        self
    }

    /// `None` leaves the loader default in place.
    pub fn worker_count(mut self, count: Option<usize>) -> Self {
        self.worker_count = count;
        self
    }

    pub fn pending_timeout_secs(mut self, secs: Option<u64>) -> Self {
        self.pending_timeout_secs = secs;
        self
    }

    pub fn duplicate_policy(mut self, policy: &str) -> Self {
        self.duplicate_policy = policy.to_string();
        self
    }

    pub fn to_json(&self) -> String {
        let mut dispatch = serde_json::json!({
            "target_timeout_secs": self.target_timeout_secs,
            "channel_capacity": 16
        });
        if let Some(count) = self.worker_count {
            dispatch["worker_count"] = serde_json::json!(count);
        }

        serde_json::json!({
            "version": "1.0",
            "database": { "path": self.database_path },
            "targets": {
                "pdf": { "base_url": self.pdf_url },
                "excel": { "base_url": self.excel_url }
            },
            "dispatch": dispatch,
            "pending": { "timeout_secs": self.pending_timeout_secs, "sweep_interval_secs": 1 },
            "duplicates": { "policy": self.duplicate_policy },
            "notification": { "recipient": "reports@example.com" }
        })
        .to_string()
    }

    pub fn build(self) -> Config {
        load_config_from_str(&self.to_json()).expect("Failed to build config")
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
