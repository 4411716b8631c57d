//! # Probe Core
//!
//! Core functionality of probe, a test harness for staging web applications
//! and their JSON APIs.
//!
//! This crate provides the fundamental building blocks for probe, including:
//! - Test runner with per-test scope, serial groups and retries
//! - HTTP client that captures masked request/response records
//! - Session login with run- or test-scoped token reuse
//! - Response assertions and `check!` macros
//! - Bounded-wait browser flows on top of WebDriver
//! - Report artifacts and reporters (terminal, HTML, JSON)
//!
//! ## Architecture (block diagram)
//!
//! ```text
//! +---------------------+      +---------------------+      +---------------------+
//! | test definitions    | ---> | runner (execution)  | ---> | reporters           |
//! | #[probe::test]      |      | + event channel     |      | list/html/json/null |
//! +---------------------+      +---------------------+      +---------------------+
//!            |                   ^        ^        ^                  ^
//!            v                   |        |        |                  |
//! +---------------------+        |        |        |       +---------------------+
//! | session (token)     | ---publish------+        +------ | report::attach      |
//! | http client + logs  |        |                         | artifacts           |
//! +---------------------+        |                         +---------------------+
//!            |                   |
//!            v                   |
//! +---------------------+   +---------------------+
//! | assertion           |   | browser slot + flow |
//! | assert_success      |   | (WebDriver)         |
//! +---------------------+   +---------------------+
//! ```
//!
//! Most users should use the main `probe` crate rather than importing `probe-core` directly.

#[doc(hidden)]
pub mod assertion;
pub mod browser;
pub mod config;
pub mod error;
pub mod http;
pub mod masking;
pub mod report;
pub mod reporter;
#[doc(hidden)]
pub mod runner;
pub mod session;

// Re-export procedural macros
pub use probe_derive::{main, test};

// Re-export error handling crates
pub use anyhow;
pub use eyre;
pub use pretty_assertions;

/// Name of a project, one per target environment (e.g. "staging").
pub type ProjectName = String;

/// Module path of a test, e.g. "api::login".
pub type ModuleName = String;

/// Function name of a test.
pub type TestName = String;

// Re-export key functionality
pub use config::{get_config, load_probe_config, Config, ProjectConfig};
pub use error::{Error, Result};
pub use reporter::{HtmlReporter, JsonReporter, ListReporter, NullReporter, Reporter, ReporterType};
pub use runner::{
    Filter, ModuleFilter, ProjectFilter, Runner, TestIgnoreFilter, TestInfo, TestNameFilter,
};
