//! # Report
//!
//! Artifacts attached by tests and the report model the reporters build from
//! the runner's event stream.
//!
//! Attaching never fails a test. Outside of a test the artifact is dropped
//! with a debug log, and a value that cannot be serialized is replaced by a
//! text placeholder saying so.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::*;

use crate::{
    http, masking,
    runner::{self, Test},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ArtifactKind {
    Text,
    Json,
}

/// Named diagnostic attached to a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub name: String,
    pub kind: ArtifactKind,
    pub body: String,
}

impl Artifact {
    pub fn text(name: impl Into<String>, body: impl Into<String>) -> Artifact {
        Artifact {
            name: name.into(),
            kind: ArtifactKind::Text,
            body: body.into(),
        }
    }

    /// JSON artifact from already serialized text.
    pub fn json(name: impl Into<String>, body: impl Into<String>) -> Artifact {
        Artifact {
            name: name.into(),
            kind: ArtifactKind::Json,
            body: body.into(),
        }
    }

    /// Pretty printed and masked JSON artifact. A value that does not serialize becomes a
    /// text placeholder.
    pub fn json_value<T: Serialize + ?Sized>(name: impl Into<String>, value: &T) -> Artifact {
        let name = name.into();
        let body = serde_json::to_value(value)
            .and_then(|value| serde_json::to_string_pretty(&masking::mask_json(&value)));
        match body {
            Ok(body) => Artifact::json(name, body),
            Err(e) => {
                warn!("artifact \"{name}\" could not be serialized: {e}");
                Artifact::text(name, format!("<serialization failed: {e}>"))
            }
        }
    }
}

/// Attach an artifact to the test running in the current task.
pub fn attach(artifact: Artifact) {
    let name = artifact.name.clone();
    if !runner::publish_attachment(artifact) {
        debug!("artifact \"{name}\" dropped: not inside a test");
    }
}

pub fn attach_text(name: impl Into<String>, body: impl Into<String>) {
    attach(Artifact::text(name, body));
}

pub fn attach_json<T: Serialize + ?Sized>(name: impl Into<String>, value: &T) {
    attach(Artifact::json_value(name, value));
}

/// Attach the masked request record of a call.
pub fn attach_request(name: impl Into<String>, request: &http::RequestRecord) {
    attach_json(name, request);
}

/// Attach a response body, pretty printed when it is JSON. Sensitive fields are masked.
pub fn attach_response(name: impl Into<String>, response: &http::Response) {
    let name = name.into();
    let artifact = match serde_json::from_str::<serde_json::Value>(response.text()) {
        Ok(value) => Artifact::json_value(name, &value),
        Err(_) => Artifact::text(name, response.text()),
    };
    attach(artifact);
}

/// What to do when a test attaches two artifacts with the same name.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, strum::EnumString, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Every attachment is kept in attachment order.
    #[default]
    Keep,
    /// Only the latest attachment of a name is kept, at the position of the first one.
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "lowercase")]
pub enum Outcome {
    Running,
    Passed,
    Failed(String),
}

/// Summary of one HTTP call for the failure context.
#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub latency_ms: Option<u128>,
    pub error: Option<String>,
}

impl From<&http::Log> for CallSummary {
    fn from(log: &http::Log) -> CallSummary {
        CallSummary {
            method: log.request.method.to_string(),
            url: log.request.url.to_string(),
            status: log.response.as_ref().map(|r| r.status.as_u16()),
            latency_ms: log.latency().map(|d| d.as_millis()),
            error: log.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct FailureContext<'a> {
    test: String,
    project: &'a str,
    args: Option<&'a str>,
    error: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    http_calls: Vec<CallSummary>,
    attachments: Vec<&'a str>,
}

/// One test of the report.
#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    pub project: String,
    pub module: String,
    pub name: String,
    pub args: Option<String>,
    pub outcome: Outcome,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub http: Vec<http::Log>,
    pub attachments: Vec<Artifact>,
}

impl Entry {
    fn new(project: &str, module: &str, name: &str) -> Entry {
        Entry {
            project: project.to_string(),
            module: module.to_string(),
            name: name.to_string(),
            args: None,
            outcome: Outcome::Running,
            started_at: None,
            finished_at: None,
            http: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}::{}", self.module, self.name)
    }

    pub fn duration(&self) -> Option<std::time::Duration> {
        (self.finished_at? - self.started_at?).to_std().ok()
    }

    pub fn attachment(&self, name: &str) -> Option<&Artifact> {
        self.attachments.iter().find(|a| a.name == name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub title: String,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<Entry>,
}

impl Report {
    pub fn passed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.outcome == Outcome::Passed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, Outcome::Failed(_)))
            .count()
    }

    pub fn to_json(&self) -> eyre::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Self-contained HTML document.
    pub fn to_html(&self) -> String {
        let mut out = String::new();
        out.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
        out.push_str(&format!("<title>{}</title>\n", html_escape(&self.title)));
        out.push_str(STYLE);
        out.push_str("</head>\n<body>\n");
        out.push_str(&format!("<h1>{}</h1>\n", html_escape(&self.title)));
        out.push_str(&format!(
            "<p class=\"summary\">{} passed, {} failed, generated at {}</p>\n",
            self.passed(),
            self.failed(),
            self.generated_at.to_rfc3339()
        ));

        for entry in &self.entries {
            let (class, label) = match &entry.outcome {
                Outcome::Passed => ("passed", "PASSED"),
                Outcome::Failed(_) => ("failed", "FAILED"),
                Outcome::Running => ("running", "INCOMPLETE"),
            };
            out.push_str(&format!("<section class=\"test {class}\">\n"));
            out.push_str(&format!(
                "<h2><span class=\"badge\">{label}</span> [{}] {}",
                html_escape(&entry.project),
                html_escape(&entry.full_name())
            ));
            if let Some(args) = &entry.args {
                out.push_str(&format!(" <code>({})</code>", html_escape(args)));
            }
            if let Some(duration) = entry.duration() {
                out.push_str(&format!(" <small>{} ms</small>", duration.as_millis()));
            }
            out.push_str("</h2>\n");

            if let Outcome::Failed(error) = &entry.outcome {
                out.push_str(&format!("<pre class=\"error\">{}</pre>\n", html_escape(error)));
            }

            if !entry.http.is_empty() {
                out.push_str("<table>\n<tr><th>method</th><th>url</th><th>status</th><th>latency</th></tr>\n");
                for call in entry.http.iter().map(CallSummary::from) {
                    let status = match (call.status, &call.error) {
                        (Some(status), _) => status.to_string(),
                        (None, Some(error)) => error.clone(),
                        (None, None) => "-".to_string(),
                    };
                    let latency = call
                        .latency_ms
                        .map(|ms| format!("{ms} ms"))
                        .unwrap_or_else(|| "-".to_string());
                    out.push_str(&format!(
                        "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                        html_escape(&call.method),
                        html_escape(&call.url),
                        html_escape(&status),
                        latency
                    ));
                }
                out.push_str("</table>\n");
            }

            for artifact in &entry.attachments {
                out.push_str(&format!(
                    "<details><summary>{} <small>{}</small></summary><pre>{}</pre></details>\n",
                    html_escape(&artifact.name),
                    artifact.kind,
                    html_escape(&artifact.body)
                ));
            }
            out.push_str("</section>\n");
        }

        out.push_str("</body>\n</html>\n");
        out
    }
}

const STYLE: &str = r#"<style>
body { font-family: sans-serif; margin: 2em; }
section.test { border-left: 6px solid #999; padding: 0 1em; margin-bottom: 1.5em; }
section.passed { border-color: #2e7d32; }
section.failed { border-color: #c62828; }
.badge { font-size: 0.7em; padding: 2px 6px; border-radius: 3px; background: #eee; }
pre { background: #f6f8fa; padding: 0.5em; overflow-x: auto; }
pre.error { color: #c62828; }
table { border-collapse: collapse; margin: 0.5em 0; }
td, th { border: 1px solid #ddd; padding: 2px 8px; text-align: left; }
</style>
"#;

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

type Key = (String, String, String);

/// Builds a [`Report`] from runner events.
#[derive(Debug)]
pub struct Recorder {
    policy: DuplicatePolicy,
    index: HashMap<Key, usize>,
    report: Report,
}

impl Recorder {
    pub fn new(title: impl Into<String>, policy: DuplicatePolicy) -> Recorder {
        Recorder {
            policy,
            index: HashMap::new(),
            report: Report {
                title: title.into(),
                generated_at: Utc::now(),
                entries: Vec::new(),
            },
        }
    }

    fn entry(&mut self, project: &str, module: &str, name: &str) -> &mut Entry {
        let key = (project.to_string(), module.to_string(), name.to_string());
        let idx = match self.index.get(&key) {
            Some(idx) => *idx,
            None => {
                self.report.entries.push(Entry::new(project, module, name));
                let idx = self.report.entries.len() - 1;
                self.index.insert(key, idx);
                idx
            }
        };
        &mut self.report.entries[idx]
    }

    pub fn on_start(&mut self, project: &str, module: &str, name: &str) {
        let entry = self.entry(project, module, name);
        entry.started_at = Some(Utc::now());
    }

    pub fn on_http_call(&mut self, project: &str, module: &str, name: &str, log: http::Log) {
        self.entry(project, module, name).http.push(log);
    }

    pub fn attach(&mut self, project: &str, module: &str, name: &str, artifact: Artifact) {
        let policy = self.policy;
        let attachments = &mut self.entry(project, module, name).attachments;
        match policy {
            DuplicatePolicy::Keep => attachments.push(artifact),
            DuplicatePolicy::Overwrite => {
                match attachments.iter_mut().find(|a| a.name == artifact.name) {
                    Some(existing) => *existing = artifact,
                    None => attachments.push(artifact),
                }
            }
        }
    }

    /// Records the outcome. A failed test gets a `Failure Context` artifact.
    pub fn on_end(&mut self, project: &str, module: &str, name: &str, test: &Test) {
        let entry = self.entry(project, module, name);
        entry.args = test.info.args.clone();
        entry.started_at = Some(test.started_at);
        entry.finished_at = Some(test.finished_at);

        let error = match &test.result {
            Ok(()) => {
                entry.outcome = Outcome::Passed;
                return;
            }
            Err(e) => e.to_string(),
        };
        entry.outcome = Outcome::Failed(error.clone());

        let context = FailureContext {
            test: entry.full_name(),
            project,
            args: test.info.args.as_deref(),
            error,
            started_at: test.started_at,
            finished_at: test.finished_at,
            http_calls: entry.http.iter().map(CallSummary::from).collect(),
            attachments: entry.attachments.iter().map(|a| a.name.as_str()).collect(),
        };
        let artifact = Artifact::json_value("Failure Context", &context);
        self.attach(project, module, name, artifact);
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    pub fn into_report(mut self) -> Report {
        self.report.generated_at = Utc::now();
        self.report
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runner::{self, test_scope, Message, TestInfo};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn finished(result: Result<(), runner::Error>, args: Option<&str>) -> Test {
        Test {
            info: TestInfo {
                args: args.map(Into::into),
                ..TestInfo::new("api", "get_organization")
            },
            result,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn keep_policy_persists_every_attachment() {
        let mut recorder = Recorder::new("r", DuplicatePolicy::Keep);
        recorder.on_start("staging", "api", "login");
        recorder.attach("staging", "api", "login", Artifact::text("Response", "first"));
        recorder.attach("staging", "api", "login", Artifact::text("Response", "second"));

        let bodies: Vec<_> = recorder.report().entries[0]
            .attachments
            .iter()
            .map(|a| a.body.as_str())
            .collect();
        assert_eq!(bodies, vec!["first", "second"]);
    }

    #[test]
    fn overwrite_policy_keeps_latest_per_name() {
        let mut recorder = Recorder::new("r", DuplicatePolicy::Overwrite);
        recorder.on_start("staging", "api", "login");
        recorder.attach("staging", "api", "login", Artifact::text("Response", "first"));
        recorder.attach("staging", "api", "login", Artifact::text("Payload", "p"));
        recorder.attach("staging", "api", "login", Artifact::text("Response", "second"));

        let attachments: Vec<_> = recorder.report().entries[0]
            .attachments
            .iter()
            .map(|a| (a.name.as_str(), a.body.as_str()))
            .collect();
        assert_eq!(attachments, vec![("Response", "second"), ("Payload", "p")]);
    }

    #[test]
    fn failure_context_is_attached_even_without_other_artifacts() -> eyre::Result<()> {
        let mut recorder = Recorder::new("r", DuplicatePolicy::Keep);
        recorder.on_start("staging", "api", "get_organization");
        recorder.on_end(
            "staging",
            "api",
            "get_organization",
            &finished(
                Err(runner::Error::ErrorReturned("status 500".into())),
                Some("48, 115"),
            ),
        );

        let entry = &recorder.report().entries[0];
        assert!(matches!(&entry.outcome, Outcome::Failed(e) if e.contains("status 500")));
        let context = entry.attachment("Failure Context").unwrap();
        assert_eq!(context.kind, ArtifactKind::Json);
        let context: serde_json::Value = serde_json::from_str(&context.body)?;
        assert_eq!(context["args"], "48, 115");
        assert_eq!(context["test"], "api::get_organization");
        assert_eq!(context["http_calls"], json!([]));
        Ok(())
    }

    #[test]
    fn passed_test_has_no_failure_context() {
        let mut recorder = Recorder::new("r", DuplicatePolicy::Keep);
        recorder.on_end("staging", "api", "get_organization", &finished(Ok(()), None));

        let report = recorder.into_report();
        assert_eq!(report.passed(), 1);
        assert!(report.entries[0].attachments.is_empty());
    }

    #[test]
    fn unserializable_value_becomes_placeholder() {
        struct Broken;
        impl Serialize for Broken {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("broken on purpose"))
            }
        }

        let artifact = Artifact::json_value("Response Body", &Broken);
        assert_eq!(artifact.kind, ArtifactKind::Text);
        assert_eq!(artifact.name, "Response Body");
        assert!(artifact.body.contains("broken on purpose"));
    }

    #[test]
    fn json_artifacts_are_masked() {
        let artifact = Artifact::json_value(
            "Request Payload",
            &json!({"email": "qa@example.com", "password": "hunter2"}),
        );
        assert!(!artifact.body.contains("hunter2"));
        assert!(artifact.body.contains("qa@example.com"));
    }

    #[test]
    fn attach_outside_of_a_test_is_a_no_op() {
        attach_text("Formatted Response", "nothing listens");
    }

    #[tokio::test]
    async fn attach_publishes_to_the_current_test() -> eyre::Result<()> {
        let (scope, mut rx) = test_scope("staging", "api", "login");
        runner::SCOPE
            .scope(scope, async { attach_text("Formatted Response", "ok") })
            .await;

        let Message::Attachment(project, _, test, artifact) = rx.recv().await? else {
            eyre::bail!("expected an attachment");
        };
        assert_eq!(project, "staging");
        assert_eq!(test, "login");
        assert_eq!(*artifact, Artifact::text("Formatted Response", "ok"));
        Ok(())
    }

    #[test]
    fn html_is_escaped_and_titled() {
        let mut recorder = Recorder::new("Website Test Report", DuplicatePolicy::Keep);
        recorder.attach(
            "staging",
            "ui",
            "homepage",
            Artifact::text("Page Source", "<script>alert(1)</script>"),
        );
        recorder.on_end(
            "staging",
            "ui",
            "homepage",
            &finished(Err(runner::Error::Panicked("<boom>".into())), None),
        );

        let html = recorder.report().to_html();
        assert!(html.contains("<title>Website Test Report</title>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>alert(1)</script>"));
        assert!(html.contains("FAILED"));
    }
}
