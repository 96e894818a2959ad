//! Shared test utilities for reportgen integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring a coordinator around scripted targets
//! - Scripted targets and a recording notifier
//! - Builders for payloads and configs

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::*;
