/// probe's test runner
use backon::Retryable;
use chrono::{DateTime, Utc};
use futures::{stream::FuturesUnordered, FutureExt, StreamExt};
use itertools::Itertools;
use std::{
    collections::{HashMap, HashSet},
    pin::Pin,
    sync::Arc,
};
use tokio::sync::broadcast;
use tracing::*;
use uuid::Uuid;

use crate::{
    browser,
    config::{self, load_probe_config, ProjectConfig},
    http,
    report::Artifact,
    reporter::Reporter,
    session::{Credentials, SessionStore},
    Config, ModuleName, ProjectName, TestName,
};

/// Capacity of the per-run event channel.
const CHANNEL_CAPACITY: usize = 4096;

tokio::task_local! {
    /// Identity and event sink of the test currently executing in this task.
    pub static SCOPE: Arc<TestScope>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("panic: {0}")]
    Panicked(String),
    #[error("error: {0}")]
    ErrorReturned(String),
}

#[derive(Debug, Clone)]
pub enum Message {
    Start(ProjectName, ModuleName, TestName),
    HttpLog(ProjectName, ModuleName, TestName, Box<http::Log>),
    Attachment(ProjectName, ModuleName, TestName, Box<Artifact>),
    End(ProjectName, ModuleName, TestName, Test),
}

#[derive(Debug, Clone)]
pub struct Test {
    pub info: TestInfo,
    pub result: Result<(), Error>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TestInfo {
    pub module: String,
    pub name: String,
    /// Stringified arguments of a parameterized test.
    pub args: Option<String>,
    /// Tests sharing a group run one after another and share group resources.
    pub serial_group: Option<String>,
    pub line: u32,
}

impl TestInfo {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> TestInfo {
        TestInfo {
            module: module.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Full test name including module
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.module, self.name)
    }

    /// Unique test name including project and module names
    pub fn unique_name(&self, project: &str) -> String {
        format!("{project}::{}::{}", self.module, self.name)
    }
}

/// Everything a test body can reach through its task: who it is, which run it belongs to,
/// where its events go and where its session tokens live.
pub struct TestScope {
    pub run_id: Uuid,
    pub project: Arc<ProjectConfig>,
    pub info: TestInfo,
    pub sessions: Arc<SessionStore>,
    tx: broadcast::Sender<Message>,
}

impl TestScope {
    pub fn new(
        project: Arc<ProjectConfig>,
        info: TestInfo,
        sessions: Arc<SessionStore>,
        tx: broadcast::Sender<Message>,
    ) -> TestScope {
        TestScope {
            run_id: sessions.run_id(),
            project,
            info,
            sessions,
            tx,
        }
    }

    fn publish(&self, make: impl FnOnce(ProjectName, ModuleName, TestName) -> Message) {
        let msg = make(
            self.project.name.clone(),
            self.info.module.clone(),
            self.info.name.clone(),
        );
        if self.tx.send(msg).is_err() {
            trace!("no reporter is listening to the runner channel");
        }
    }
}

/// Scope of the test running in the current task, if any.
pub fn current() -> Option<Arc<TestScope>> {
    SCOPE.try_with(Arc::clone).ok()
}

pub(crate) fn publish_http(log: http::Log) {
    if let Some(scope) = current() {
        scope.publish(|p, m, t| Message::HttpLog(p, m, t, Box::new(log)));
    }
}

/// Returns false when called outside of a test.
pub(crate) fn publish_attachment(artifact: Artifact) -> bool {
    match current() {
        Some(scope) => {
            scope.publish(|p, m, t| Message::Attachment(p, m, t, Box::new(artifact)));
            true
        }
        None => false,
    }
}

pub type TestCaseFactory = Arc<
    dyn Fn() -> Pin<Box<dyn futures::Future<Output = eyre::Result<()>> + Send + 'static>>
        + Sync
        + Send
        + 'static,
>;

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub capture_http: bool,
    pub capture_rust: bool,
}

/// Test case filter trait.
pub trait Filter {
    fn filter(&self, project: &ProjectConfig, info: &TestInfo) -> bool;
}

/// Filter test cases by project name.
pub struct ProjectFilter<'a> {
    project_names: &'a [String],
}

impl Filter for ProjectFilter<'_> {
    fn filter(&self, project: &ProjectConfig, _info: &TestInfo) -> bool {
        self.project_names.is_empty()
            || self
                .project_names
                .iter()
                .any(|project_name| &project.name == project_name)
    }
}

/// Filter test cases by module name. A name matches whole path segments anywhere in the
/// module path, so `api` selects `probe_suite::api::login`.
pub struct ModuleFilter<'a> {
    module_names: &'a [String],
}

impl Filter for ModuleFilter<'_> {
    fn filter(&self, _project: &ProjectConfig, info: &TestInfo) -> bool {
        let path = format!("::{}::", info.module);
        self.module_names.is_empty()
            || self
                .module_names
                .iter()
                .any(|module_name| path.contains(&format!("::{module_name}::")))
    }
}

/// Filter test cases by test name. Both `module::name` and the bare name match.
pub struct TestNameFilter<'a> {
    test_names: &'a [String],
}

impl Filter for TestNameFilter<'_> {
    fn filter(&self, _project: &ProjectConfig, info: &TestInfo) -> bool {
        self.test_names.is_empty()
            || self
                .test_names
                .iter()
                .any(|test_name| &info.full_name() == test_name || &info.name == test_name)
    }
}

/// Filter test cases by the `test_ignore` list of each project.
pub struct TestIgnoreFilter {
    test_ignores: HashMap<String, Vec<String>>,
}

impl TestIgnoreFilter {
    pub fn from_config(cfg: &Config) -> TestIgnoreFilter {
        TestIgnoreFilter {
            test_ignores: cfg
                .projects
                .iter()
                .map(|proj| (proj.name.clone(), proj.test_ignore.clone()))
                .collect(),
        }
    }
}

impl Default for TestIgnoreFilter {
    fn default() -> TestIgnoreFilter {
        TestIgnoreFilter::from_config(&load_probe_config().cloned().unwrap_or_default())
    }
}

impl Filter for TestIgnoreFilter {
    fn filter(&self, project: &ProjectConfig, info: &TestInfo) -> bool {
        let Some(test_ignore) = self.test_ignores.get(&project.name) else {
            return true;
        };

        test_ignore
            .iter()
            .all(|test_name| &info.full_name() != test_name)
    }
}

struct Case {
    project: Arc<ProjectConfig>,
    info: TestInfo,
    factory: TestCaseFactory,
}

pub struct Runner {
    cfg: Config,
    options: Options,
    test_cases: Vec<(TestInfo, TestCaseFactory)>,
    /// Full names registered more than once.
    duplicates: Vec<String>,
    reporters: Vec<Box<dyn Reporter + Send>>,
    launcher: Arc<dyn browser::Launcher>,
}

impl Default for Runner {
    fn default() -> Self {
        Runner::with_config(Config::default())
    }
}

impl Runner {
    pub fn new() -> Runner {
        Runner::with_config(load_probe_config().cloned().unwrap_or_default())
    }

    pub fn with_config(cfg: Config) -> Runner {
        Runner {
            cfg,
            options: Options::default(),
            test_cases: Vec::new(),
            duplicates: Vec::new(),
            reporters: Vec::new(),
            launcher: Arc::new(browser::WebDriverLauncher),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn capture_http(&mut self) {
        self.options.capture_http = true;
    }

    pub fn capture_rust(&mut self) {
        self.options.capture_rust = true;
    }

    pub fn add_reporter(&mut self, reporter: impl Reporter + 'static + Send) {
        self.reporters.push(Box::new(reporter));
    }

    pub fn add_boxed_reporter(&mut self, reporter: Box<dyn Reporter + 'static + Send>) {
        self.reporters.push(reporter);
    }

    /// Replace how browsers are launched for UI tests.
    pub fn set_launcher(&mut self, launcher: impl browser::Launcher + 'static) {
        self.launcher = Arc::new(launcher);
    }

    /// Add a test case to the runner. A second case with the same `module::name` is
    /// not added, and makes [`Runner::run`] fail before any test starts.
    pub fn add_test(
        &mut self,
        name: &str,
        module: &str,
        args: Option<&str>,
        serial_group: Option<&str>,
        line: u32,
        factory: TestCaseFactory,
    ) {
        let info = TestInfo {
            name: name.into(),
            module: module.into(),
            args: args.map(Into::into),
            serial_group: serial_group.map(Into::into),
            line,
        };
        if self
            .test_cases
            .iter()
            .any(|(existing, _)| existing.module == info.module && existing.name == info.name)
        {
            error!("test \"{}\" is registered more than once", info.full_name());
            self.duplicates.push(info.full_name());
            return;
        }
        self.test_cases.push((info, factory));
    }

    fn select(&self, project_names: &[String], module_names: &[String], test_names: &[String]) -> Vec<Case> {
        let project_filter = ProjectFilter { project_names };
        let module_filter = ModuleFilter { module_names };
        let test_name_filter = TestNameFilter { test_names };
        let test_ignore_filter = TestIgnoreFilter::from_config(&self.cfg);

        self.test_cases
            .iter()
            .flat_map(|(info, factory)| {
                self.cfg.projects.iter().map(move |project| Case {
                    project: project.clone(),
                    info: info.clone(),
                    factory: factory.clone(),
                })
            })
            .filter(|case| project_filter.filter(&case.project, &case.info))
            .filter(|case| module_filter.filter(&case.project, &case.info))
            .filter(|case| test_name_filter.filter(&case.project, &case.info))
            .filter(|case| test_ignore_filter.filter(&case.project, &case.info))
            .collect()
    }

    /// Run probe runner. Fails when any selected test fails, when a test name is registered
    /// twice, or when the configuration of a selected project is incomplete; in the latter
    /// two cases no test is started.
    pub async fn run(
        &mut self,
        project_names: &[String],
        module_names: &[String],
        test_names: &[String],
    ) -> eyre::Result<()> {
        if self.options.capture_rust {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
        }

        if !self.duplicates.is_empty() {
            eyre::bail!(
                "configuration error: test names registered more than once: {}",
                self.duplicates.iter().unique().join(", ")
            );
        }

        let cases = self.select(project_names, module_names, test_names);

        let browser_projects: HashSet<&str> = cases
            .iter()
            .filter(|c| uses_browser(&c.info))
            .map(|c| c.project.name.as_str())
            .collect();
        for project in cases.iter().map(|c| &c.project).unique_by(|p| p.name.clone()) {
            preflight(project, browser_projects.contains(project.name.as_str())).map_err(|e| {
                eyre::eyre!("configuration error in project \"{}\": {e}", project.name)
            })?;
        }

        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let mut reporters = std::mem::take(&mut self.reporters);
        let receivers: Vec<_> = reporters.iter().map(|_| tx.subscribe()).collect();
        let reporters = futures::future::join_all(
            reporters
                .iter_mut()
                .zip(receivers)
                .map(|(reporter, rx)| reporter.run(rx).boxed()),
        );

        let sessions = Arc::new(SessionStore::new(Uuid::new_v4()));
        info!("run {} started with {} test(s)", sessions.run_id(), cases.len());

        let handles: FuturesUnordered<_> = group(cases)
            .into_iter()
            .map(|cases| {
                let slot = Arc::new(browser::Slot::new(self.launcher.clone()));
                let sessions = sessions.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut passed = true;
                    for case in cases {
                        passed &= run_case(case, sessions.clone(), slot.clone(), tx.clone()).await;
                    }
                    slot.release().await;
                    passed
                })
            })
            .collect();
        drop(tx);

        let runner = async move {
            let results = handles.collect::<Vec<_>>().await;
            if results.is_empty() {
                console::Term::stdout().write_line("no test cases found")?;
            }
            let mut has_any_error = false;
            for result in results {
                match result {
                    Ok(passed) => has_any_error |= !passed,
                    Err(e) => {
                        error!("test task aborted: {e}");
                        has_any_error = true;
                    }
                }
            }
            debug!("all test finished");

            if has_any_error {
                eyre::bail!("one or more tests failed");
            }

            eyre::Ok(())
        };

        let (result, reporter_results) = tokio::join!(runner, reporters);
        for res in reporter_results {
            if let Err(e) = res {
                warn!("reporter failed: {e:#}");
            }
        }

        debug!("runner stopped");

        result
    }

    pub fn list(&self) -> Vec<&TestInfo> {
        self.test_cases
            .iter()
            .map(|(meta, _test)| meta)
            .collect::<Vec<_>>()
    }
}

/// Browser tests live in a `ui` module or the `ui` serial group.
fn uses_browser(info: &TestInfo) -> bool {
    info.serial_group.as_deref() == Some("ui") || info.module.split("::").any(|segment| segment == "ui")
}

/// Resolves everything a project needs before the first request goes out.
fn preflight(project: &ProjectConfig, browser: bool) -> eyre::Result<()> {
    project.validate()?;
    Credentials::from_project(project)?;
    if browser || project.data.contains_key("web_url") {
        project.web_url()?;
    }
    Ok(())
}

/// Serial tests of the same project and group are chained into one sequence in source
/// order; every other test forms a sequence of its own.
fn group(cases: Vec<Case>) -> Vec<Vec<Case>> {
    let mut groups: Vec<Vec<Case>> = Vec::new();
    let mut serial: HashMap<(String, String), Vec<Case>> = HashMap::new();
    for case in cases {
        match &case.info.serial_group {
            Some(group) => serial
                .entry((case.project.name.clone(), group.clone()))
                .or_default()
                .push(case),
            None => groups.push(vec![case]),
        }
    }
    for (_, mut cases) in serial.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)) {
        cases.sort_by(|a, b| (&a.info.module, a.info.line).cmp(&(&b.info.module, b.info.line)));
        groups.push(cases);
    }
    groups
}

async fn run_case(
    case: Case,
    sessions: Arc<SessionStore>,
    slot: Arc<browser::Slot>,
    tx: broadcast::Sender<Message>,
) -> bool {
    let Case {
        project,
        info,
        factory,
    } = case;
    let test_name = info.name.clone();
    let scope = Arc::new(TestScope::new(project.clone(), info.clone(), sessions, tx));
    scope.publish(Message::Start);

    let started_at = Utc::now();
    let backoff = project.retry.backoff();
    let fut = async move {
        let f = || async { factory().await };
        std::panic::AssertUnwindSafe(f.retry(backoff))
            .catch_unwind()
            .await
    };
    let res = config::PROJECT
        .scope(
            project.clone(),
            SCOPE.scope(scope.clone(), browser::SLOT.scope(slot, fut)),
        )
        .await;

    let result = match res {
        Ok(Ok(_)) => {
            debug!("{test_name} ok");
            Ok(())
        }
        Ok(Err(e)) => {
            debug!("{test_name} failed: {e:#}");
            Err(Error::ErrorReturned(format!("{e:?}")))
        }
        Err(e) => {
            let panic_message = if let Some(panic_message) = e.downcast_ref::<&str>() {
                format!("{test_name} failed with message: {panic_message}")
            } else if let Some(panic_message) = e.downcast_ref::<String>() {
                format!("{test_name} failed with message: {panic_message}")
            } else {
                format!("{test_name} failed with unknown message")
            };
            Err(Error::Panicked(panic_message))
        }
    };

    let passed = result.is_ok();
    let test = Test {
        info,
        result,
        started_at,
        finished_at: Utc::now(),
    };
    scope.publish(|p, m, t| Message::End(p, m, t, test));
    passed
}

/// Scope for unit tests that exercise code expecting to run inside a test.
#[cfg(test)]
pub(crate) fn test_scope(
    project: &str,
    module: &str,
    name: &str,
) -> (Arc<TestScope>, broadcast::Receiver<Message>) {
    let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
    let project = Arc::new(ProjectConfig {
        name: project.into(),
        ..Default::default()
    });
    let sessions = Arc::new(SessionStore::new(Uuid::new_v4()));
    (
        Arc::new(TestScope::new(project, TestInfo::new(module, name), sessions, tx)),
        rx,
    )
}
