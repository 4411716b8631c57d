//! probe's HTTP client is a thin wrapper around `reqwest::Client` that
//! * offers the familiar builder interface of `reqwest::Client`
//! * captures a masked request/response record for every call and publishes it to the runner
//! * never treats a non-2xx status as an error; only transport failures are errors
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use tracing::*;
use url::Url;

use crate::{
    config::{self, DEFAULT_TIMEOUT},
    masking, runner,
};

pub use reqwest::{Method, StatusCode};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("TransportError(timeout): no response from {url} within {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("TransportError(connect): could not reach {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("TransportError: {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid request: {0}")]
    Request(String),
    #[error("failed to deserialize http response into the specified type: {0}")]
    Deserialize(#[from] serde_json::Error),
}

impl Error {
    /// `url` must already be masked. The url inside `e` carries the raw query and is dropped.
    fn classify(e: reqwest::Error, url: &Url, timeout: Duration) -> Error {
        let e = e.without_url();
        let url = url.to_string();
        if e.is_timeout() {
            Error::Timeout { url, timeout }
        } else if e.is_connect() {
            Error::Connect {
                url,
                reason: format!("{e:#}"),
            }
        } else if e.is_builder() {
            Error::Request(format!("{e:#}"))
        } else {
            Error::Transport { url, source: e }
        }
    }

    /// Whether the call made no definitive progress (network or timeout).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::Connect { .. } | Error::Transport { .. }
        )
    }
}

/// What was sent. Secrets are masked at capture time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RequestRecord {
    #[serde(with = "method_serde")]
    pub method: Method,
    pub url: Url,
    #[serde(with = "headers_serde")]
    pub headers: HeaderMap,
    pub params: Vec<(String, String)>,
    pub body: Option<String>,
    pub sent_at: DateTime<Utc>,
}

impl RequestRecord {
    fn capture(req: &reqwest::Request, body: Option<&str>) -> RequestRecord {
        let params: Vec<(String, String)> = req
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        RequestRecord {
            method: req.method().clone(),
            url: masking::mask_url(req.url()),
            headers: masking::mask_headers(req.headers()),
            params: masking::mask_pairs(&params),
            body: body.map(masking::mask_body),
            sent_at: Utc::now(),
        }
    }
}

/// What came back. The copy handed to the caller is raw; the copy published in a [`Log`] is
/// masked.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Response {
    #[serde(with = "headers_serde")]
    pub headers: HeaderMap,
    #[serde(with = "status_serde")]
    pub status: StatusCode,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Alias used where the response is discussed as a captured record.
pub type ResponseRecord = Response;

impl Response {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_str(&self.text)?)
    }

    /// Body re-indented when it is JSON, verbatim otherwise.
    pub fn pretty_body(&self) -> String {
        serde_json::from_str::<serde_json::Value>(&self.text)
            .and_then(|v| serde_json::to_string_pretty(&v))
            .unwrap_or_else(|_| self.text.clone())
    }

    fn masked(&self) -> Response {
        Response {
            headers: masking::mask_headers(&self.headers),
            status: self.status,
            text: masking::mask_body(&self.text),
            received_at: self.received_at,
        }
    }

    async fn read(res: reqwest::Response) -> Result<Response, reqwest::Error> {
        let headers = res.headers().clone();
        let status = res.status();
        let text = res.text().await?;
        Ok(Response {
            headers,
            status,
            text,
            received_at: Utc::now(),
        })
    }
}

/// One completed call.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub request: RequestRecord,
    pub response: Response,
}

/// Masked record of a call as published to reporters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Log {
    pub request: RequestRecord,
    pub response: Option<Response>,
    pub error: Option<String>,
}

impl Log {
    pub fn latency(&self) -> Option<Duration> {
        let received_at = self.response.as_ref()?.received_at;
        (received_at - self.request.sent_at).to_std().ok()
    }
}

/// probe's http client that is compatible to `reqwest::Client`.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: reqwest::Client,
    timeout: Duration,
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

impl Client {
    /// Construct probe's HTTP client. Inside a test the project's `timeout` is the default.
    pub fn new() -> Client {
        let timeout = config::PROJECT
            .try_with(|project| project.timeout().ok())
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_TIMEOUT);
        Client {
            inner: reqwest::Client::new(),
            timeout,
        }
    }

    /// Default timeout for every request built by this client.
    pub fn with_timeout(mut self, timeout: Duration) -> Client {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn request(&self, method: Method, url: impl reqwest::IntoUrl) -> RequestBuilder {
        RequestBuilder {
            inner: self.inner.request(method, url),
            client: self.inner.clone(),
            timeout: self.timeout,
            body: None,
        }
    }

    pub fn get(&self, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    pub fn delete(&self, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }
}

pub struct RequestBuilder {
    pub(crate) inner: reqwest::RequestBuilder,
    pub(crate) client: reqwest::Client,
    timeout: Duration,
    body: Option<String>,
}

impl RequestBuilder {
    pub fn header<K, V>(mut self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        self.inner = self.inner.header(key, value);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        self.inner = self.inner.headers(headers);
        self
    }

    pub fn bearer_auth<T: std::fmt::Display>(mut self, token: T) -> RequestBuilder {
        self.inner = self.inner.bearer_auth(token);
        self
    }

    pub fn query<T: serde::Serialize + ?Sized>(mut self, query: &T) -> RequestBuilder {
        self.inner = self.inner.query(query);
        self
    }

    pub fn json<T: serde::Serialize + ?Sized>(mut self, json: &T) -> RequestBuilder {
        self.body = serde_json::to_string(json).ok();
        self.inner = self.inner.json(json);
        self
    }

    /// Overrides the client's timeout for this request only.
    pub fn timeout(mut self, timeout: Duration) -> RequestBuilder {
        self.timeout = timeout;
        self
    }

    pub async fn send(self) -> Result<Response, Error> {
        Ok(self.exchange().await?.response)
    }

    /// Sends the request and returns both captured records.
    pub async fn exchange(self) -> Result<Exchange, Error> {
        let req = self
            .inner
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::Request(format!("{e:#}")))?;
        let url = req.url().clone();
        let request = RequestRecord::capture(&req, self.body.as_deref());
        debug!("Requesting {} {}", request.method, request.url);

        let result = async {
            let res = self.client.execute(req).await?;
            Response::read(res).await
        }
        .await;

        match result {
            Ok(response) => {
                debug!(
                    "{} {} -> {}",
                    request.method, request.url, response.status
                );
                runner::publish_http(Log {
                    request: request.clone(),
                    response: Some(response.masked()),
                    error: None,
                });
                Ok(Exchange { request, response })
            }
            Err(e) => {
                let err = Error::classify(e, &masking::mask_url(&url), self.timeout);
                warn!("{} {} failed: {err}", request.method, request.url);
                runner::publish_http(Log {
                    request,
                    response: None,
                    error: Some(err.to_string()),
                });
                Err(err)
            }
        }
    }
}

mod method_serde {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(method: &reqwest::Method, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(method.as_str())
    }
}

mod status_serde {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(status: &reqwest::StatusCode, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u16(status.as_u16())
    }
}

mod headers_serde {
    use reqwest::header::HeaderMap;
    use serde::{ser::SerializeSeq, Serializer};

    pub fn serialize<S: Serializer>(headers: &HeaderMap, s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(headers.len()))?;
        for (name, value) in headers {
            seq.serialize_element(&(name.as_str(), value.to_str().unwrap_or("<binary>")))?;
        }
        seq.end()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runner::{test_scope, Message};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn non_success_status_is_not_an_error() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/missing")
            .with_status(404)
            .with_body("not here")
            .create_async()
            .await;

        let res = Client::new()
            .get(format!("{}/missing", server.url()))
            .send()
            .await?;

        m.assert_async().await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(res.text(), "not here");
        Ok(())
    }

    #[tokio::test]
    async fn exchange_records_params_and_timestamps() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/org")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("org_id".into(), "48".into()),
                mockito::Matcher::UrlEncoded("token".into(), "raw-token".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"success":true}"#)
            .create_async()
            .await;

        let exchange = Client::new()
            .get(format!("{}/org", server.url()))
            .query(&[("org_id", "48"), ("token", "raw-token")])
            .exchange()
            .await?;

        assert_eq!(
            exchange.request.params,
            vec![
                ("org_id".to_string(), "48".to_string()),
                ("token".to_string(), masking::MASK.to_string()),
            ]
        );
        assert!(!exchange.request.url.as_str().contains("raw-token"));
        assert!(exchange.request.sent_at <= exchange.response.received_at);
        assert_eq!(exchange.response.status(), StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn published_log_is_masked() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/login")
            .with_status(200)
            .with_body(r#"{"token":"issued-token","user":"qa"}"#)
            .create_async()
            .await;

        let (scope, mut rx) = test_scope("staging", "http", "published_log_is_masked");
        let res = runner::SCOPE
            .scope(scope, async {
                Client::new()
                    .post(format!("{}/login", server.url()))
                    .bearer_auth("secret-bearer")
                    .json(&json!({"email": "qa@example.com", "password": "hunter2"}))
                    .send()
                    .await
            })
            .await?;

        // The caller still sees the raw body.
        assert!(res.text().contains("issued-token"));

        let Message::HttpLog(_, _, _, log) = rx.recv().await? else {
            eyre::bail!("expected an http log");
        };
        assert_eq!(log.request.headers.get("authorization").unwrap(), masking::MASK);
        let body: serde_json::Value = serde_json::from_str(log.request.body.as_deref().unwrap())?;
        assert_eq!(body["password"], masking::MASK);
        assert_eq!(body["email"], "qa@example.com");
        let response = log.response.as_ref().unwrap();
        assert!(!response.text.contains("issued-token"));
        assert!(log.latency().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn timeout_is_a_transport_error() -> eyre::Result<()> {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let _hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let err = Client::new()
            .get(format!("http://{addr}/slow"))
            .timeout(Duration::from_millis(200))
            .send()
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }), "{err}");
        assert!(err.is_transport());
        assert!(err.to_string().contains("timeout"));
        Ok(())
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() -> eyre::Result<()> {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
            listener.local_addr()?
        };

        let err = Client::new()
            .get(format!("http://{addr}/"))
            .send()
            .await
            .unwrap_err();

        assert!(err.is_transport(), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn transport_error_never_carries_the_raw_query() -> eyre::Result<()> {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
            listener.local_addr()?
        };

        let (scope, mut rx) = test_scope("staging", "http", "refused_with_token");
        let err = runner::SCOPE
            .scope(scope, async {
                Client::new()
                    .get(format!("http://{addr}/org"))
                    .query(&[("org_id", "48"), ("token", "raw-session-token")])
                    .send()
                    .await
            })
            .await
            .unwrap_err();

        let msg = format!("{err:#} {err:?}");
        assert!(!msg.contains("raw-session-token"), "{msg}");
        assert!(msg.contains("token=*****"), "{msg}");

        let Message::HttpLog(_, _, _, log) = rx.recv().await? else {
            eyre::bail!("expected an http log");
        };
        let logged = log.error.as_deref().unwrap();
        assert!(!logged.contains("raw-session-token"), "{logged}");
        Ok(())
    }

    #[test]
    fn default_timeout_outside_of_a_test_scope() {
        assert_eq!(Client::new().timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn pretty_body_falls_back_to_raw_text() {
        let res = Response {
            headers: HeaderMap::new(),
            status: StatusCode::OK,
            text: "plain".into(),
            received_at: Utc::now(),
        };
        assert_eq!(res.pretty_body(), "plain");

        let res = Response {
            text: r#"{"a":1}"#.into(),
            ..res
        };
        assert_eq!(res.pretty_body(), "{\n  \"a\": 1\n}");
    }
}
