//! # Session
//!
//! Login once, reuse the token. The token lifetime is chosen per project
//! with `token_scope`:
//!
//! - `run` (default): the first test that asks for a token logs in, every
//!   other test of the same run and project reuses it.
//! - `test`: every test logs in on its own.
//!
//! Tokens live in a [`SessionStore`] owned by a single runner invocation and
//! keyed by run id (and test id), so one run can never observe another
//! run's token. In `run` scope a failed login is stored as well, which makes
//! every test depending on it fail straight away without issuing more calls.
//! In `test` scope a failure is dropped, so a retried test logs in again.
//!
//! ```rust,ignore
//! #[probe::test]
//! async fn get_organization() -> eyre::Result<()> {
//!     let token = probe::session::token().await?;
//!     let res = Client::new()
//!         .get(probe::get_config().api_url("api/v1/get-organizition")?)
//!         .bearer_auth(token.as_str())
//!         .send()
//!         .await?;
//!     Ok(())
//! }
//! ```
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::OnceCell;
use tracing::*;
use url::Url;
use uuid::Uuid;

use crate::{config::ProjectConfig, http::Client, masking, report, runner};

/// Path of the login endpoint relative to the project's `base_url`.
pub const LOGIN_PATH: &str = "api/v1/login";

/// Lifetime of a session token.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    strum::EnumString,
    strum::Display,
    serde::Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TokenScope {
    /// One login per run and project.
    #[default]
    Run,
    /// One login per test.
    Test,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("ConfigurationError: {0}")]
    Configuration(#[from] crate::Error),
    #[error("ConfigurationError: \"{0}\" is required to log in")]
    MissingCredential(&'static str),
    #[error("AuthenticationError: login request failed: {0}")]
    Transport(String),
    #[error("AuthenticationError: login failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("AuthenticationError: no token received in login response")]
    MissingToken,
    #[error("a session token was requested outside of a probe test")]
    OutsideOfTest,
}

impl Error {
    /// True for failures of the login call itself, as opposed to configuration faults.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Status { .. } | Error::MissingToken
        )
    }
}

/// Test identity. Immutable once built; `Debug` never shows the password.
#[derive(Clone)]
pub struct Credentials {
    email: String,
    password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Result<Credentials, Error> {
        let email = email.into();
        let password = password.into();
        if email.trim().is_empty() {
            return Err(Error::MissingCredential("email"));
        }
        if password.is_empty() {
            return Err(Error::MissingCredential("password"));
        }
        Ok(Credentials { email, password })
    }

    /// Reads `email` and `password` of the project.
    pub fn from_project(project: &ProjectConfig) -> Result<Credentials, Error> {
        let email = project
            .get_str("email")
            .map_err(|_| Error::MissingCredential("email"))?;
        let password = project
            .get_str("password")
            .map_err(|_| Error::MissingCredential("password"))?;
        Credentials::new(email, password)
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// Raw password, for typing into a login form. Never log it.
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &masking::MASK)
            .finish()
    }
}

/// Opaque bearer token. Cloning shares the same allocation; it is never modified.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(Arc<str>);

impl Token {
    pub fn new(raw: &str) -> Token {
        Token(Arc::from(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether both handles point at the token issued by the same login.
    pub fn same_login(&self, other: &Token) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Token").field(&masking::MASK).finish()
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Performs the login call.
#[derive(Clone)]
pub struct Authenticator {
    client: Client,
    login_url: Url,
}

impl Authenticator {
    pub fn new(login_url: Url) -> Authenticator {
        Authenticator {
            client: Client::new(),
            login_url,
        }
    }

    pub fn for_project(project: &ProjectConfig) -> Result<Authenticator, Error> {
        let login_url = project.api_url(LOGIN_PATH)?;
        Ok(Authenticator::new(login_url).with_client(Client::new().with_timeout(project.timeout()?)))
    }

    pub fn with_client(mut self, client: Client) -> Authenticator {
        self.client = client;
        self
    }

    /// Logs in once. The call is captured and attached to the current test whatever happens.
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<Token, Error> {
        let payload = LoginRequest {
            email: &credentials.email,
            password: &credentials.password,
        };
        report::attach_json("Request Payload", &payload);

        let res = match self
            .client
            .post(self.login_url.clone())
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
        {
            Ok(res) => res,
            Err(e) => {
                error!("Authentication failed: {e}");
                return Err(Error::Transport(e.to_string()));
            }
        };

        report::attach_response("Full Response", &res);

        if !res.status().is_success() {
            error!("Authentication failed with status {}", res.status());
            return Err(Error::Status {
                status: res.status().as_u16(),
                body: masking::preview(res.text()),
            });
        }

        let token = serde_json::from_str::<serde_json::Value>(res.text())
            .ok()
            .and_then(|body| body.get("token")?.as_str().map(Token::new))
            .filter(|token| !token.as_str().is_empty())
            .ok_or(Error::MissingToken)?;

        info!("Successfully obtained authentication token for {}", credentials.email);
        Ok(token)
    }
}

/// Key of a cached token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    Run { run_id: Uuid, project: String },
    Test { run_id: Uuid, project: String, test: String },
}

type Slot = Arc<OnceCell<Result<Token, Error>>>;

/// Token cache of one run.
#[derive(Debug)]
pub struct SessionStore {
    run_id: Uuid,
    slots: Mutex<HashMap<ScopeKey, Slot>>,
}

impl SessionStore {
    pub fn new(run_id: Uuid) -> SessionStore {
        SessionStore {
            run_id,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn key(&self, scope: TokenScope, project: &str, test: &str) -> ScopeKey {
        match scope {
            TokenScope::Run => ScopeKey::Run {
                run_id: self.run_id,
                project: project.to_string(),
            },
            TokenScope::Test => ScopeKey::Test {
                run_id: self.run_id,
                project: project.to_string(),
                test: test.to_string(),
            },
        }
    }

    /// Returns the outcome stored under `key`, running `login` only if nothing is stored yet.
    /// Concurrent callers with the same key wait for the same login. A failure under a
    /// [`ScopeKey::Test`] key is handed to those callers and then forgotten.
    pub async fn get_or_login<F, Fut>(&self, key: ScopeKey, login: F) -> Result<Token, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Token, Error>>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(key.clone()).or_default().clone()
        };
        let result = slot.get_or_init(login).await.clone();
        if result.is_err() && matches!(key, ScopeKey::Test { .. }) {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if slots.get(&key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                slots.remove(&key);
            }
        }
        result
    }
}

/// Session token for the current test, honoring the project's `token_scope`.
pub async fn token() -> Result<Token, Error> {
    let scope = runner::current().ok_or(Error::OutsideOfTest)?;
    let project = scope.project.clone();
    let key = scope.sessions.key(
        project.token_scope()?,
        &project.name,
        &scope.info.full_name(),
    );
    debug!("session token requested for {key:?}");

    scope
        .sessions
        .get_or_login(key, || async move {
            let credentials = Credentials::from_project(&project)?;
            Authenticator::for_project(&project)?
                .authenticate(&credentials)
                .await
        })
        .await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runner::{test_scope, Message, TestInfo, TestScope, SCOPE};
    use mockito::Matcher;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use toml::Value as TomlValue;

    fn authenticator(server: &mockito::Server) -> Authenticator {
        Authenticator::new(Url::parse(&format!("{}/api/v1/login", server.url())).unwrap())
    }

    fn credentials() -> Credentials {
        Credentials::new("qa@example.com", "correct-horse").unwrap()
    }

    fn scope_for(
        base_url: &str,
        token_scope: &str,
        test: &str,
        sessions: Arc<SessionStore>,
    ) -> Arc<TestScope> {
        let project = ProjectConfig {
            name: "staging".into(),
            data: [
                ("base_url", base_url),
                ("email", "qa@example.com"),
                ("password", "correct-horse"),
                ("token_scope", token_scope),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), TomlValue::String(v.to_string())))
            .collect(),
            ..Default::default()
        };
        let (tx, _) = tokio::sync::broadcast::channel(16);
        Arc::new(TestScope::new(
            Arc::new(project),
            TestInfo::new("api", test),
            sessions,
            tx,
        ))
    }

    #[test]
    fn credentials_require_email_and_password() {
        assert!(matches!(
            Credentials::new("", "secret"),
            Err(Error::MissingCredential("email"))
        ));
        assert!(matches!(
            Credentials::new("qa@example.com", ""),
            Err(Error::MissingCredential("password"))
        ));
    }

    #[test]
    fn credentials_and_token_do_not_leak_through_debug() {
        let debug = format!("{:?} {:?}", credentials(), Token::new("eyJ0eXAi"));
        assert!(!debug.contains("correct-horse"), "{debug}");
        assert!(!debug.contains("eyJ0eXAi"), "{debug}");
    }

    #[tokio::test]
    async fn valid_login_returns_token() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/api/v1/login")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({
                "email": "qa@example.com",
                "password": "correct-horse"
            })))
            .with_status(200)
            .with_body(r#"{"token":"eyJ0eXAi.valid","user":{"id":1384}}"#)
            .create_async()
            .await;

        let token = authenticator(&server).authenticate(&credentials()).await?;

        m.assert_async().await;
        assert_eq!(token.as_str(), "eyJ0eXAi.valid");
        Ok(())
    }

    #[tokio::test]
    async fn rejected_login_names_the_status() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/api/v1/login")
            .with_status(401)
            .with_body(r#"{"message":"Invalid credentials"}"#)
            .create_async()
            .await;

        let err = authenticator(&server)
            .authenticate(&credentials())
            .await
            .unwrap_err();

        assert!(err.is_authentication());
        assert!(matches!(err, Error::Status { status: 401, .. }));
        assert!(err.to_string().contains("401"), "{err}");
    }

    #[tokio::test]
    async fn success_without_token_field() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/api/v1/login")
            .with_status(200)
            .with_body(r#"{"success":true}"#)
            .create_async()
            .await;

        let err = authenticator(&server)
            .authenticate(&credentials())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MissingToken));
        assert!(err.to_string().contains("no token received"));
    }

    #[tokio::test]
    async fn unreachable_login_wraps_the_transport_error() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let auth = Authenticator::new(Url::parse(&format!("http://{addr}/api/v1/login")).unwrap());

        let err = auth.authenticate(&credentials()).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "{err}");
    }

    #[tokio::test]
    async fn login_is_captured_and_attached_regardless_of_outcome() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/api/v1/login")
            .with_status(500)
            .with_body("upstream down")
            .create_async()
            .await;

        let (scope, mut rx) = test_scope("staging", "api", "login");
        let result = SCOPE
            .scope(scope, authenticator(&server).authenticate(&credentials()))
            .await;
        assert!(result.is_err());

        let mut attachments = Vec::new();
        let mut http_logs = 0;
        while let Ok(msg) = rx.try_recv() {
            match msg {
                Message::Attachment(_, _, _, artifact) => attachments.push(artifact),
                Message::HttpLog(_, _, _, log) => {
                    http_logs += 1;
                    assert_eq!(log.response.as_ref().map(|r| r.status.as_u16()), Some(500));
                }
                _ => {}
            }
        }
        assert_eq!(http_logs, 1);
        let names: Vec<_> = attachments.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Request Payload", "Full Response"]);
        assert!(!attachments[0].body.contains("correct-horse"));
        Ok(())
    }

    #[tokio::test]
    async fn run_scope_reuses_the_identical_token() -> eyre::Result<()> {
        let store = SessionStore::new(Uuid::new_v4());
        let logins = AtomicUsize::new(0);
        let login = || async {
            logins.fetch_add(1, Ordering::SeqCst);
            Ok(Token::new("t"))
        };

        let a = store
            .get_or_login(store.key(TokenScope::Run, "staging", "api::a"), login)
            .await?;
        let b = store
            .get_or_login(store.key(TokenScope::Run, "staging", "api::b"), login)
            .await?;

        assert_eq!(logins.load(Ordering::SeqCst), 1);
        assert!(a.same_login(&b));
        Ok(())
    }

    #[tokio::test]
    async fn test_scope_logs_in_for_every_test() -> eyre::Result<()> {
        let store = SessionStore::new(Uuid::new_v4());
        let logins = AtomicUsize::new(0);
        let login = || async {
            let n = logins.fetch_add(1, Ordering::SeqCst);
            Ok(Token::new(&format!("t{n}")))
        };

        let a = store
            .get_or_login(store.key(TokenScope::Test, "staging", "api::a"), login)
            .await?;
        let again = store
            .get_or_login(store.key(TokenScope::Test, "staging", "api::a"), login)
            .await?;
        let b = store
            .get_or_login(store.key(TokenScope::Test, "staging", "api::b"), login)
            .await?;

        assert_eq!(logins.load(Ordering::SeqCst), 2);
        assert!(a.same_login(&again));
        assert!(!a.same_login(&b));
        Ok(())
    }

    #[tokio::test]
    async fn separate_runs_never_share_tokens() {
        let first = SessionStore::new(Uuid::new_v4());
        let second = SessionStore::new(Uuid::new_v4());
        assert_ne!(
            first.key(TokenScope::Run, "staging", "api::a"),
            second.key(TokenScope::Run, "staging", "api::a")
        );
    }

    #[tokio::test]
    async fn failed_login_is_not_retried_within_scope() {
        let store = SessionStore::new(Uuid::new_v4());
        let logins = AtomicUsize::new(0);
        let login = || async {
            logins.fetch_add(1, Ordering::SeqCst);
            Err(Error::Status {
                status: 401,
                body: String::new(),
            })
        };

        for test in ["api::a", "api::b", "api::c"] {
            let res = store
                .get_or_login(store.key(TokenScope::Run, "staging", test), login)
                .await;
            assert!(res.is_err());
        }
        assert_eq!(logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scope_logs_in_again_after_a_failure() -> eyre::Result<()> {
        let store = SessionStore::new(Uuid::new_v4());
        let logins = AtomicUsize::new(0);
        let login = || async {
            match logins.fetch_add(1, Ordering::SeqCst) {
                0 => Err(Error::Transport("connection reset".into())),
                _ => Ok(Token::new("second-attempt")),
            }
        };
        let key = || store.key(TokenScope::Test, "staging", "api::flaky");

        assert!(store.get_or_login(key(), login).await.is_err());
        let token = store.get_or_login(key(), login).await?;
        let again = store.get_or_login(key(), login).await?;

        assert_eq!(logins.load(Ordering::SeqCst), 2);
        assert_eq!(token.as_str(), "second-attempt");
        assert!(token.same_login(&again));
        Ok(())
    }

    #[tokio::test]
    async fn retried_test_logs_in_again_in_test_scope() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("POST", "/api/v1/login")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let sessions = Arc::new(SessionStore::new(Uuid::new_v4()));
        let scope = scope_for(&server.url(), "test", "flaky", sessions);
        assert!(SCOPE.scope(scope.clone(), token()).await.is_err());
        rejected.assert_async().await;
        rejected.remove_async().await;

        let accepted = server
            .mock("POST", "/api/v1/login")
            .with_status(200)
            .with_body(r#"{"token":"retry-token"}"#)
            .expect(1)
            .create_async()
            .await;
        let token = SCOPE.scope(scope, token()).await?;
        accepted.assert_async().await;
        assert_eq!(token.as_str(), "retry-token");
        Ok(())
    }

    #[tokio::test]
    async fn token_outside_of_a_test() {
        assert!(matches!(token().await, Err(Error::OutsideOfTest)));
    }

    #[tokio::test]
    async fn token_in_run_scope_logs_in_once() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/api/v1/login")
            .with_status(200)
            .with_body(r#"{"token":"run-token"}"#)
            .expect(1)
            .create_async()
            .await;

        let sessions = Arc::new(SessionStore::new(Uuid::new_v4()));
        let first = SCOPE
            .scope(scope_for(&server.url(), "run", "first", sessions.clone()), token())
            .await?;
        let second = SCOPE
            .scope(scope_for(&server.url(), "run", "second", sessions), token())
            .await?;

        m.assert_async().await;
        assert!(first.same_login(&second));
        Ok(())
    }

    #[tokio::test]
    async fn token_in_test_scope_logs_in_per_test() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/api/v1/login")
            .with_status(200)
            .with_body(r#"{"token":"test-token"}"#)
            .expect(2)
            .create_async()
            .await;

        let sessions = Arc::new(SessionStore::new(Uuid::new_v4()));
        for test in ["first", "second"] {
            SCOPE
                .scope(scope_for(&server.url(), "test", test, sessions.clone()), token())
                .await?;
        }

        m.assert_async().await;
        Ok(())
    }

    #[tokio::test]
    async fn missing_password_fails_before_any_call() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/api/v1/login")
            .expect(0)
            .create_async()
            .await;

        let (base, _rx) = test_scope("staging", "api", "login");
        let project = ProjectConfig {
            name: "staging".into(),
            data: [
                ("base_url".to_string(), TomlValue::String(server.url())),
                ("email".to_string(), TomlValue::String("qa@example.com".into())),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        };
        let (tx, _) = tokio::sync::broadcast::channel(16);
        let scope = Arc::new(TestScope::new(
            Arc::new(project),
            base.info.clone(),
            base.sessions.clone(),
            tx,
        ));

        let err = SCOPE.scope(scope, token()).await.unwrap_err();
        m.assert_async().await;
        assert!(matches!(err, Error::MissingCredential("password")), "{err}");
    }
}
