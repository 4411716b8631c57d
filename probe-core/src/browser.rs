//! # Browser
//!
//! UI tests drive a real browser through a WebDriver server (chromedriver,
//! selenium) using `thirtyfour`. The browser sits behind the [`Driver`]
//! trait so flows can be exercised without one.
//!
//! A browser is a scoped resource. The runner gives every serial group a
//! [`Slot`]; the first test of the group that calls [`session`] launches
//! the browser, the following tests of the group reuse it, and the runner
//! quits it when the group ends, whatever the tests did.
//!
//! ```rust,ignore
//! #[probe::test(serial = "ui")]
//! async fn test_login() -> eyre::Result<()> {
//!     let cfg = probe::get_config();
//!     let mut flow = FormFlow::new(browser::session().await?, FlowConfig::from_project(&cfg)?);
//!     flow.navigate(cfg.page_url("login")?.as_str()).await?;
//!     flow.locate(&[("email", cfg.get_str("email")?), ("password", cfg.get_str("password")?)], "login").await?;
//!     flow.submit().await?;
//!     flow.verify(&PostCondition::SourceContains("Welcome".into())).await?;
//!     Ok(())
//! }
//! ```
use std::{future::Future, sync::Arc, time::Duration};
use thirtyfour::{prelude::*, ChromiumLikeCapabilities};
use tokio::{sync::Mutex, time::Instant};
use tracing::*;

use crate::{config::{self, ProjectConfig}, report};

pub const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:4444";
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("NavigationError: {url} did not load within {timeout:?}: {reason}")]
    Navigation {
        url: String,
        timeout: Duration,
        reason: String,
    },
    #[error("ElementNotFoundError: \"{id}\" was not {expected} within {timeout:?} (page title {title:?})")]
    ElementNotFound {
        id: String,
        expected: &'static str,
        timeout: Duration,
        title: String,
    },
    #[error("post-condition {condition} not met within {timeout:?} (page title {title:?})")]
    PostCondition {
        condition: String,
        timeout: Duration,
        title: String,
    },
    #[error("invalid flow transition from {from} to {to}")]
    InvalidTransition { from: FlowState, to: FlowState },
    #[error("WebDriver error: {0}")]
    Driver(String),
    #[error("browser session has already been closed")]
    Closed,
    #[error("a browser was requested outside of a probe test")]
    OutsideOfTest,
    #[error("ConfigurationError: {0}")]
    Configuration(#[from] crate::Error),
}

impl From<WebDriverError> for Error {
    fn from(e: WebDriverError) -> Error {
        Error::Driver(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    Missing,
    Present,
    Clickable,
}

/// Browser operations a UI flow needs. Elements are addressed by id.
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), Error>;
    async fn title(&self) -> Result<String, Error>;
    async fn source(&self) -> Result<String, Error>;
    async fn element_state(&self, id: &str) -> Result<ElementState, Error>;
    /// Replaces the value of an input.
    async fn fill(&self, id: &str, value: &str) -> Result<(), Error>;
    async fn click(&self, id: &str) -> Result<(), Error>;
    /// Closes the browser. Further calls fail with [`Error::Closed`].
    async fn quit(&self) -> Result<(), Error>;
}

/// Starts browsers for a project.
#[async_trait::async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, project: &ProjectConfig) -> Result<Arc<dyn Driver>, Error>;
}

/// Launches Chrome through the WebDriver server at `webdriver_url`, headless unless
/// `headless = false`.
pub struct WebDriverLauncher;

#[async_trait::async_trait]
impl Launcher for WebDriverLauncher {
    async fn launch(&self, project: &ProjectConfig) -> Result<Arc<dyn Driver>, Error> {
        let server_url = match project.get_str("webdriver_url") {
            Ok(url) => url.to_string(),
            Err(crate::Error::ValueNotFound(_)) => DEFAULT_WEBDRIVER_URL.to_string(),
            Err(e) => return Err(e.into()),
        };
        let headless = match project.get_bool("headless") {
            Ok(headless) => headless,
            Err(crate::Error::ValueNotFound(_)) => true,
            Err(e) => return Err(e.into()),
        };

        let mut caps = DesiredCapabilities::chrome();
        if headless {
            caps.add_arg("--headless=new")?;
        }
        caps.add_arg("--window-size=1920,1080")?;

        info!("starting browser through {server_url} (headless: {headless})");
        let driver = WebDriver::new(server_url.as_str(), caps).await?;
        Ok(Arc::new(WebDriverSession {
            driver: Mutex::new(Some(driver)),
        }))
    }
}

/// [`Driver`] backed by a `thirtyfour` session.
pub struct WebDriverSession {
    driver: Mutex<Option<WebDriver>>,
}

#[async_trait::async_trait]
impl Driver for WebDriverSession {
    async fn goto(&self, url: &str) -> Result<(), Error> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().ok_or(Error::Closed)?;
        Ok(driver.goto(url).await?)
    }

    async fn title(&self) -> Result<String, Error> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().ok_or(Error::Closed)?;
        Ok(driver.title().await?)
    }

    async fn source(&self) -> Result<String, Error> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().ok_or(Error::Closed)?;
        Ok(driver.source().await?)
    }

    async fn element_state(&self, id: &str) -> Result<ElementState, Error> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().ok_or(Error::Closed)?;
        let elements = driver.find_all(By::Id(id)).await?;
        let Some(element) = elements.first() else {
            return Ok(ElementState::Missing);
        };
        if element.is_clickable().await? {
            Ok(ElementState::Clickable)
        } else {
            Ok(ElementState::Present)
        }
    }

    async fn fill(&self, id: &str, value: &str) -> Result<(), Error> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().ok_or(Error::Closed)?;
        let element = driver.find(By::Id(id)).await?;
        element.clear().await?;
        element.send_keys(value).await?;
        Ok(())
    }

    async fn click(&self, id: &str) -> Result<(), Error> {
        let guard = self.driver.lock().await;
        let driver = guard.as_ref().ok_or(Error::Closed)?;
        driver.find(By::Id(id)).await?.click().await?;
        Ok(())
    }

    async fn quit(&self) -> Result<(), Error> {
        if let Some(driver) = self.driver.lock().await.take() {
            driver.quit().await?;
        }
        Ok(())
    }
}

/// Browser shared by the tests of one serial group.
pub struct Slot {
    launcher: Arc<dyn Launcher>,
    driver: Mutex<Option<Arc<dyn Driver>>>,
}

impl Slot {
    pub fn new(launcher: Arc<dyn Launcher>) -> Slot {
        Slot {
            launcher,
            driver: Mutex::new(None),
        }
    }

    /// The group's browser, launched on first use.
    pub async fn acquire(&self, project: &ProjectConfig) -> Result<Arc<dyn Driver>, Error> {
        let mut driver = self.driver.lock().await;
        if let Some(driver) = driver.as_ref() {
            return Ok(driver.clone());
        }
        let launched = self.launcher.launch(project).await?;
        *driver = Some(launched.clone());
        Ok(launched)
    }

    /// Quits the browser if one was launched. Errors are logged.
    pub async fn release(&self) {
        let Some(driver) = self.driver.lock().await.take() else {
            return;
        };
        match driver.quit().await {
            Ok(()) => debug!("browser released"),
            Err(e) => warn!("failed to quit browser: {e}"),
        }
    }
}

tokio::task_local! {
    /// Browser slot of the serial group the current test belongs to.
    pub static SLOT: Arc<Slot>;
}

/// Browser for the current test.
pub async fn session() -> Result<Arc<dyn Driver>, Error> {
    let slot = SLOT.try_with(Arc::clone).map_err(|_| Error::OutsideOfTest)?;
    let project = config::PROJECT
        .try_with(Arc::clone)
        .map_err(|_| Error::OutsideOfTest)?;
    slot.acquire(&project).await
}

/// Time limits of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowConfig {
    pub navigation_timeout: Duration,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            navigation_timeout: DEFAULT_NAVIGATION_TIMEOUT,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl FlowConfig {
    /// Reads `navigation_timeout`, `wait_timeout` and `poll_interval` (milliseconds).
    pub fn from_project(project: &ProjectConfig) -> Result<FlowConfig, Error> {
        Ok(FlowConfig {
            navigation_timeout: project
                .get_millis("navigation_timeout", DEFAULT_NAVIGATION_TIMEOUT)?,
            wait_timeout: project.get_millis("wait_timeout", DEFAULT_WAIT_TIMEOUT)?,
            poll_interval: project.get_millis("poll_interval", DEFAULT_POLL_INTERVAL)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum FlowState {
    Idle,
    PageLoaded,
    ElementsLocated,
    ActionSubmitted,
    Verified,
    Failed,
}

/// What the page must show once a flow is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostCondition {
    TitleContains(String),
    SourceContains(String),
}

impl std::fmt::Display for PostCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostCondition::TitleContains(s) => write!(f, "title contains {s:?}"),
            PostCondition::SourceContains(s) => write!(f, "page contains {s:?}"),
        }
    }
}

/// Fill-and-submit flow on a single page:
/// `Idle -> PageLoaded -> ElementsLocated -> ActionSubmitted -> Verified | Failed`.
///
/// Every wait is bounded. A failed step moves the flow to `Failed`, after which only a
/// new flow can be started.
pub struct FormFlow {
    driver: Arc<dyn Driver>,
    config: FlowConfig,
    state: FlowState,
    fields: Vec<(String, String)>,
    submit: Option<String>,
}

impl FormFlow {
    pub fn new(driver: Arc<dyn Driver>, config: FlowConfig) -> FormFlow {
        FormFlow {
            driver,
            config,
            state: FlowState::Idle,
            fields: Vec::new(),
            submit: None,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    fn transition(&self, allowed: &[FlowState], to: FlowState) -> Result<(), Error> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }

    fn settle<T>(&mut self, res: Result<T, Error>, to: FlowState) -> Result<T, Error> {
        self.state = if res.is_ok() { to } else { FlowState::Failed };
        res
    }

    /// `Idle -> PageLoaded`.
    pub async fn navigate(&mut self, url: &str) -> Result<(), Error> {
        self.transition(&[FlowState::Idle], FlowState::PageLoaded)?;
        let timeout = self.config.navigation_timeout;
        debug!("navigating to {url}");
        let res = match tokio::time::timeout(timeout, self.driver.goto(url)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Navigation {
                url: url.to_string(),
                timeout,
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Navigation {
                url: url.to_string(),
                timeout,
                reason: "timed out".to_string(),
            }),
        };
        self.settle(res, FlowState::PageLoaded)
    }

    /// `PageLoaded -> ElementsLocated`. Waits until every field is present and `submit` is
    /// clickable; each element gets its own `wait_timeout`.
    pub async fn locate(&mut self, fields: &[(&str, &str)], submit: &str) -> Result<(), Error> {
        self.transition(&[FlowState::PageLoaded], FlowState::ElementsLocated)?;
        let res = self.wait_for_elements(fields, submit).await;
        if res.is_ok() {
            self.fields = fields
                .iter()
                .map(|(id, value)| (id.to_string(), value.to_string()))
                .collect();
            self.submit = Some(submit.to_string());
        }
        self.settle(res, FlowState::ElementsLocated)
    }

    async fn wait_for_elements(&self, fields: &[(&str, &str)], submit: &str) -> Result<(), Error> {
        let wanted = fields
            .iter()
            .map(|(id, _)| (*id, "present"))
            .chain(std::iter::once((submit, "clickable")));
        for (id, expected) in wanted {
            let found = poll(self.config.wait_timeout, self.config.poll_interval, || async {
                let state = self.driver.element_state(id).await?;
                Ok(match expected {
                    "clickable" => state == ElementState::Clickable,
                    _ => state != ElementState::Missing,
                }
                .then_some(()))
            })
            .await?;
            if found.is_none() {
                return Err(Error::ElementNotFound {
                    id: id.to_string(),
                    expected,
                    timeout: self.config.wait_timeout,
                    title: self.driver.title().await.unwrap_or_default(),
                });
            }
        }
        Ok(())
    }

    /// `ElementsLocated -> ActionSubmitted`.
    pub async fn submit(&mut self) -> Result<(), Error> {
        self.transition(&[FlowState::ElementsLocated], FlowState::ActionSubmitted)?;
        let res = async {
            for (id, value) in &self.fields {
                self.driver.fill(id, value).await?;
            }
            let submit = self.submit.as_deref().ok_or(Error::InvalidTransition {
                from: self.state,
                to: FlowState::ActionSubmitted,
            })?;
            self.driver.click(submit).await
        }
        .await;
        self.settle(res, FlowState::ActionSubmitted)
    }

    /// `ActionSubmitted -> Verified | Failed`. Pages without an action can be verified right
    /// after they are loaded.
    pub async fn verify(&mut self, condition: &PostCondition) -> Result<(), Error> {
        self.transition(
            &[FlowState::ActionSubmitted, FlowState::PageLoaded],
            FlowState::Verified,
        )?;
        let res = self.wait_for(condition).await;
        self.settle(res, FlowState::Verified)
    }

    async fn wait_for(&self, condition: &PostCondition) -> Result<(), Error> {
        let met = poll(self.config.wait_timeout, self.config.poll_interval, || async {
            let met = match condition {
                PostCondition::TitleContains(s) => self.driver.title().await?.contains(s.as_str()),
                PostCondition::SourceContains(s) => self.driver.source().await?.contains(s.as_str()),
            };
            Ok(met.then_some(()))
        })
        .await?;
        if met.is_some() {
            return Ok(());
        }

        let title = self.driver.title().await.unwrap_or_default();
        report::attach_text("Page Title", title.clone());
        if let Ok(source) = self.driver.source().await {
            report::attach_text("Page Source", source);
        }
        Err(Error::PostCondition {
            condition: condition.to_string(),
            timeout: self.config.wait_timeout,
            title,
        })
    }
}

/// Calls `f` every `interval` until it yields a value or `timeout` has passed. `f` runs at
/// least once.
/// Calls `f` every `interval` until it yields a value or `timeout` passes. A WebDriver error
/// counts as "not yet", since pages re-render while they are polled.
async fn poll<T, F, Fut>(timeout: Duration, interval: Duration, mut f: F) -> Result<Option<T>, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match f().await {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => {}
            Err(Error::Driver(reason)) => debug!("not ready yet: {reason}"),
            Err(e) => return Err(e),
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

/// In-memory browser for unit tests.
#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex as StdMutex,
        },
    };

    #[derive(Debug, Clone, Default)]
    pub struct FakePage {
        pub title: String,
        pub source: String,
        pub elements: HashMap<String, ElementState>,
        /// Elements report `Missing` until this much time has passed since navigation.
        pub ready_after: Duration,
        /// Time `goto` takes for this page.
        pub load_time: Duration,
        /// Page shown after any element is clicked.
        pub on_click: Option<Box<FakePage>>,
        /// Number of element lookups after navigation that fail with a stale element error.
        pub stale_reads: usize,
    }

    impl FakePage {
        pub fn new(title: &str, source: &str) -> FakePage {
            FakePage {
                title: title.into(),
                source: source.into(),
                ..Default::default()
            }
        }

        pub fn element(mut self, id: &str, state: ElementState) -> FakePage {
            self.elements.insert(id.into(), state);
            self
        }
    }

    struct Current {
        page: FakePage,
        loaded_at: Instant,
        reads: usize,
    }

    pub struct FakeDriver {
        pages: Arc<HashMap<String, FakePage>>,
        current: StdMutex<Option<Current>>,
        pub filled: StdMutex<Vec<(String, String)>>,
        pub clicked: StdMutex<Vec<String>>,
        closed: StdMutex<bool>,
        quit: Arc<AtomicUsize>,
    }

    impl FakeDriver {
        pub fn new(pages: impl IntoIterator<Item = (&'static str, FakePage)>) -> FakeDriver {
            FakeDriver::with_pages(
                Arc::new(pages.into_iter().map(|(u, p)| (u.to_string(), p)).collect()),
                Arc::default(),
            )
        }

        fn with_pages(pages: Arc<HashMap<String, FakePage>>, quit: Arc<AtomicUsize>) -> FakeDriver {
            FakeDriver {
                pages,
                current: StdMutex::new(None),
                filled: StdMutex::new(Vec::new()),
                clicked: StdMutex::new(Vec::new()),
                closed: StdMutex::new(false),
                quit,
            }
        }

        fn check_open(&self) -> Result<(), Error> {
            if *self.closed.lock().unwrap() {
                Err(Error::Closed)
            } else {
                Ok(())
            }
        }

        fn with_page<T>(&self, f: impl FnOnce(&Current) -> T) -> Result<T, Error> {
            self.check_open()?;
            let current = self.current.lock().unwrap();
            let current = current
                .as_ref()
                .ok_or_else(|| Error::Driver("no page loaded".into()))?;
            Ok(f(current))
        }
    }

    #[async_trait::async_trait]
    impl Driver for FakeDriver {
        async fn goto(&self, url: &str) -> Result<(), Error> {
            self.check_open()?;
            let page = self.pages.get(url).cloned().unwrap_or_default();
            tokio::time::sleep(page.load_time).await;
            *self.current.lock().unwrap() = Some(Current {
                page,
                loaded_at: Instant::now(),
                reads: 0,
            });
            Ok(())
        }

        async fn title(&self) -> Result<String, Error> {
            self.with_page(|c| c.page.title.clone())
        }

        async fn source(&self) -> Result<String, Error> {
            self.with_page(|c| c.page.source.clone())
        }

        async fn element_state(&self, id: &str) -> Result<ElementState, Error> {
            self.check_open()?;
            let mut current = self.current.lock().unwrap();
            let c = current
                .as_mut()
                .ok_or_else(|| Error::Driver("no page loaded".into()))?;
            if c.reads < c.page.stale_reads {
                c.reads += 1;
                return Err(Error::Driver(format!("stale element reference: {id}")));
            }
            if c.loaded_at.elapsed() < c.page.ready_after {
                return Ok(ElementState::Missing);
            }
            Ok(c.page
                .elements
                .get(id)
                .copied()
                .unwrap_or(ElementState::Missing))
        }

        async fn fill(&self, id: &str, value: &str) -> Result<(), Error> {
            self.check_open()?;
            self.filled.lock().unwrap().push((id.into(), value.into()));
            Ok(())
        }

        async fn click(&self, id: &str) -> Result<(), Error> {
            self.check_open()?;
            self.clicked.lock().unwrap().push(id.into());
            let mut current = self.current.lock().unwrap();
            if let Some(next) = current.as_ref().and_then(|c| c.page.on_click.clone()) {
                *current = Some(Current {
                    page: *next,
                    loaded_at: Instant::now(),
                    reads: 0,
                });
            }
            Ok(())
        }

        async fn quit(&self) -> Result<(), Error> {
            let mut closed = self.closed.lock().unwrap();
            if !*closed {
                *closed = true;
                self.quit.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    /// Hands out [`FakeDriver`]s and counts launches and quits.
    #[derive(Clone, Default)]
    pub struct FakeLauncher {
        pages: Arc<HashMap<String, FakePage>>,
        launched: Arc<AtomicUsize>,
        quit: Arc<AtomicUsize>,
    }

    impl FakeLauncher {
        pub fn launched(&self) -> usize {
            self.launched.load(Ordering::SeqCst)
        }

        pub fn quit(&self) -> usize {
            self.quit.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Launcher for FakeLauncher {
        async fn launch(&self, _project: &ProjectConfig) -> Result<Arc<dyn Driver>, Error> {
            self.launched.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeDriver::with_pages(
                self.pages.clone(),
                self.quit.clone(),
            )))
        }
    }
}
