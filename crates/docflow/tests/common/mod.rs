//! Shared test utilities for docflow integration tests.
//!
//! This module provides:
//! - `TestHarness`: an in-memory job store on a manual clock, wired to the
//!   enqueue gate, lease manager, janitor and an executor
//! - `ScriptedStages`: pipeline collaborators whose failures and delays are
//!   scripted per stage
//! - Builders for jobs and executor settings

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{ScriptedStages, TestHarness};
