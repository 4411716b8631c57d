//! # probe - test harness for staging web applications
//!
//! probe runs API and browser checks against a deployed environment and
//! records every step into a report: the requests that were sent, the
//! responses that came back, and what was on the page when a UI flow failed.
//!
//! ## Quick Start
//!
//! Describe the environment in `probe.toml`:
//!
//! ```toml
//! [[projects]]
//! name = "staging"
//! base_url = "https://api.staging.example.com"
//! web_url = "https://staging.example.com"
//!
//! [report]
//! title = "Website Test Report"
//! ```
//!
//! Credentials never live in the file; set `PROBE_STAGING_EMAIL` and
//! `PROBE_STAGING_PASSWORD` (or `PROBE_EMAIL`/`PROBE_PASSWORD` for every project).
//!
//! Write a test:
//!
//! ```rust,no_run
//! use probe::{assertion::{assert_success, Expectations}, eyre, get_config, http::Client, session};
//!
//! #[probe::test(48)]
//! async fn single_detail(org_id: u32) -> eyre::Result<()> {
//!     let token = session::token().await?;
//!     let url = get_config().api_url("api/v1/organization/single-detail")?;
//!     let response = Client::new()
//!         .get(url)
//!         .query(&[("org_id", org_id.to_string())])
//!         .bearer_auth(token.as_str())
//!         .send()
//!         .await?;
//!
//!     assert_success(&response, &Expectations::status(200))?;
//!     Ok(())
//! }
//!
//! #[probe::main]
//! #[tokio::main]
//! async fn main() -> eyre::Result<()> {
//!     let runner = run();
//!     let app = probe::App::new();
//!     app.run(runner).await?;
//!     Ok(())
//! }
//! ```
//!
//! `cargo run -- test --reporters list,html` runs every test against every project,
//! prints the outcome and writes the html report. The process exits with a non-zero
//! status when any test fails.
//!
//! ## Browser flows
//!
//! UI tests drive a WebDriver session through [`browser::FormFlow`]. Tests sharing a
//! serial group run one after another on the same browser, which is closed when the
//! group is done:
//!
//! ```rust,no_run
//! use probe::{browser::{self, FlowConfig, FormFlow, PostCondition}, eyre, get_config};
//!
//! #[probe::test(serial = "ui")]
//! async fn homepage_load() -> eyre::Result<()> {
//!     let project = get_config();
//!     let mut flow = FormFlow::new(browser::session().await?, FlowConfig::from_project(&project)?);
//!     flow.navigate(project.page_url("")?.as_str()).await?;
//!     flow.verify(&PostCondition::TitleContains("Example".into())).await?;
//!     Ok(())
//! }
//! ```

mod app;

// Re-export procedural macros for test and main attributes
pub use probe_derive::{main, test};

// Re-export error handling crates for user convenience
pub use anyhow;
pub use eyre;
pub use inventory;
pub use pretty_assertions;

pub use app::App;

pub use probe_core::{
    assertion, browser,
    config::{get_config, load_probe_config, Config, ProjectConfig},
    http, masking, report,
    reporter::{HtmlReporter, JsonReporter, ListReporter, NullReporter, Reporter, ReporterType},
    runner::{self, Runner, TestInfo},
    session, {check, check_eq, check_ne, check_str_eq},
};

/// Signature of the wrapper `#[probe::test]` generates around a test body.
pub type AsyncTestFn =
    fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = eyre::Result<()>> + Send + 'static>>;

/// One test case, submitted to `inventory` by `#[probe::test]`.
pub struct TestRegistration {
    pub module: &'static str,
    pub name: &'static str,
    pub args: Option<&'static str>,
    pub serial_group: Option<&'static str>,
    pub line: u32,
    pub test_fn: AsyncTestFn,
}

inventory::collect!(TestRegistration);
