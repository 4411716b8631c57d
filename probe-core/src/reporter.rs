use console::{style, Term};
use eyre::WrapErr;
use std::{collections::HashMap, path::PathBuf};
use tokio::sync::broadcast;
use tracing::*;

use crate::{
    http,
    report::{Artifact, DuplicatePolicy, Recorder},
    runner::{Message, Test},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ReporterType {
    Null,
    List,
    Html,
    Json,
}

/// Reporter trait. The trait is based on the "template method" pattern.
/// You can implement on_xxx methods to hook into the test runner. This way is enough for most usecases.
/// If you need more control, you can override the "run" method.
///
/// A failing hook is logged and the reporter keeps listening, so one broken
/// reporter never stops the run or the other reporters.
#[async_trait::async_trait]
pub trait Reporter {
    async fn run(&mut self, mut rx: broadcast::Receiver<Message>) -> eyre::Result<()> {
        loop {
            let res = match rx.recv().await {
                Ok(Message::Start(project_name, module_name, test_name)) => {
                    self.on_start(project_name, module_name, test_name).await
                }
                Ok(Message::HttpLog(project_name, module_name, test_name, log)) => {
                    self.on_http_call(project_name, module_name, test_name, log)
                        .await
                }
                Ok(Message::Attachment(project_name, module_name, test_name, artifact)) => {
                    self.on_attachment(project_name, module_name, test_name, artifact)
                        .await
                }
                Ok(Message::End(project_name, module_name, test_name, test)) => {
                    self.on_end(project_name, module_name, test_name, test)
                        .await
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("runner channel has been closed");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("reporter lagged behind the runner, {n} event(s) skipped");
                    continue;
                }
            };
            if let Err(e) = res {
                warn!("reporter failed to handle an event: {e:#}");
            }
        }

        self.on_finish().await
    }

    /// Called when a test case starts.
    async fn on_start(
        &mut self,
        _project: String,
        _module: String,
        _test_name: String,
    ) -> eyre::Result<()> {
        Ok(())
    }

    /// Called when an HTTP call is made.
    async fn on_http_call(
        &mut self,
        _project: String,
        _module: String,
        _test_name: String,
        _log: Box<http::Log>,
    ) -> eyre::Result<()> {
        Ok(())
    }

    /// Called when a test attaches an artifact.
    async fn on_attachment(
        &mut self,
        _project: String,
        _module: String,
        _test_name: String,
        _artifact: Box<Artifact>,
    ) -> eyre::Result<()> {
        Ok(())
    }

    /// Called when a test case ends.
    async fn on_end(
        &mut self,
        _project: String,
        _module: String,
        _test_name: String,
        _test: Test,
    ) -> eyre::Result<()> {
        Ok(())
    }

    /// Called once after the last test.
    async fn on_finish(&mut self) -> eyre::Result<()> {
        Ok(())
    }
}

pub struct NullReporter;

#[async_trait::async_trait]
impl Reporter for NullReporter {}

#[allow(clippy::vec_box)]
pub struct ListReporter {
    terminal: Term,
    buffer: HashMap<(String, String, String), Vec<Box<http::Log>>>,
    capture_http: bool,
}

impl ListReporter {
    pub fn new(capture_http: bool) -> ListReporter {
        ListReporter {
            terminal: Term::stdout(),
            buffer: HashMap::new(),
            capture_http,
        }
    }

    fn print_log(&self, log: &http::Log) -> eyre::Result<()> {
        write(
            &self.terminal,
            format!(" => {} {}", log.request.method, log.request.url),
        )?;
        write(&self.terminal, "  > request:")?;
        write(&self.terminal, "    > headers:")?;
        for (key, value) in log.request.headers.iter() {
            write(
                &self.terminal,
                format!("       > {key}: {}", value.to_str().unwrap_or("<binary>")),
            )?;
        }
        if let Some(body) = &log.request.body {
            write(&self.terminal, format!("    > body: {body}"))?;
        }
        match (&log.response, &log.error) {
            (Some(response), _) => {
                let latency = log
                    .latency()
                    .map(|d| format!(" ({} ms)", d.as_millis()))
                    .unwrap_or_default();
                write(
                    &self.terminal,
                    format!("  < response: {}{latency}", response.status),
                )?;
                write(&self.terminal, "    < headers:")?;
                for (key, value) in response.headers.iter() {
                    write(
                        &self.terminal,
                        format!("       < {key}: {}", value.to_str().unwrap_or("<binary>")),
                    )?;
                }
                write(&self.terminal, format!("    < body: {}", response.text))?;
            }
            (None, Some(error)) => write(&self.terminal, format!("  < error: {error}"))?,
            (None, None) => {}
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Reporter for ListReporter {
    async fn on_start(
        &mut self,
        project_name: String,
        module_name: String,
        test_name: String,
    ) -> eyre::Result<()> {
        self.buffer
            .insert((project_name, module_name, test_name), Vec::new());
        Ok(())
    }

    async fn on_http_call(
        &mut self,
        project_name: String,
        module_name: String,
        test_name: String,
        log: Box<http::Log>,
    ) -> eyre::Result<()> {
        if self.capture_http {
            self.buffer
                .entry((project_name, module_name, test_name))
                .or_default()
                .push(log);
        }
        Ok(())
    }

    async fn on_end(
        &mut self,
        project_name: String,
        module_name: String,
        test_name: String,
        test: Test,
    ) -> eyre::Result<()> {
        let http_logs = self
            .buffer
            .remove(&(project_name.clone(), module_name, test_name))
            .unwrap_or_default();

        for log in http_logs {
            self.print_log(&log)?;
        }

        let Test { result, info, .. } = test;
        let args = info
            .args
            .as_ref()
            .map(|args| format!("({args})"))
            .unwrap_or_default();
        match result {
            Ok(_res) => {
                let status = style("✓").green();
                self.terminal.write_line(&format!(
                    "{status} [{project_name}] {}{args}",
                    info.full_name()
                ))?;
            }
            Err(e) => {
                let status = style("✘").red();
                self.terminal.write_line(&format!(
                    "{status} [{project_name}] {}{args}: {e:#}",
                    info.full_name()
                ))?;
            }
        }

        Ok(())
    }
}

fn write(term: &Term, s: impl AsRef<str>) -> eyre::Result<()> {
    let colored = style(s.as_ref()).dim();
    term.write_line(&format!("{colored}"))
        .wrap_err("failed to write character on terminal")
}

/// Feeds every event into a [`Recorder`].
#[async_trait::async_trait]
impl Reporter for Recorder {
    async fn on_start(&mut self, project: String, module: String, test_name: String) -> eyre::Result<()> {
        Recorder::on_start(self, &project, &module, &test_name);
        Ok(())
    }

    async fn on_http_call(
        &mut self,
        project: String,
        module: String,
        test_name: String,
        log: Box<http::Log>,
    ) -> eyre::Result<()> {
        Recorder::on_http_call(self, &project, &module, &test_name, *log);
        Ok(())
    }

    async fn on_attachment(
        &mut self,
        project: String,
        module: String,
        test_name: String,
        artifact: Box<Artifact>,
    ) -> eyre::Result<()> {
        self.attach(&project, &module, &test_name, *artifact);
        Ok(())
    }

    async fn on_end(
        &mut self,
        project: String,
        module: String,
        test_name: String,
        test: Test,
    ) -> eyre::Result<()> {
        Recorder::on_end(self, &project, &module, &test_name, &test);
        Ok(())
    }
}

/// Writes the report as an HTML document when the run finishes.
pub struct HtmlReporter {
    recorder: Recorder,
    path: PathBuf,
}

impl HtmlReporter {
    pub fn new(title: impl Into<String>, path: impl Into<PathBuf>, policy: DuplicatePolicy) -> HtmlReporter {
        HtmlReporter {
            recorder: Recorder::new(title, policy),
            path: path.into(),
        }
    }
}

/// Writes the report model as JSON when the run finishes.
pub struct JsonReporter {
    recorder: Recorder,
    path: PathBuf,
}

impl JsonReporter {
    pub fn new(title: impl Into<String>, path: impl Into<PathBuf>, policy: DuplicatePolicy) -> JsonReporter {
        JsonReporter {
            recorder: Recorder::new(title, policy),
            path: path.into(),
        }
    }
}

macro_rules! delegate_to_recorder {
    ($reporter:ty, $render:expr, $format:literal) => {
        #[async_trait::async_trait]
        impl Reporter for $reporter {
            async fn on_start(&mut self, p: String, m: String, t: String) -> eyre::Result<()> {
                Reporter::on_start(&mut self.recorder, p, m, t).await
            }

            async fn on_http_call(
                &mut self,
                p: String,
                m: String,
                t: String,
                log: Box<http::Log>,
            ) -> eyre::Result<()> {
                Reporter::on_http_call(&mut self.recorder, p, m, t, log).await
            }

            async fn on_attachment(
                &mut self,
                p: String,
                m: String,
                t: String,
                artifact: Box<Artifact>,
            ) -> eyre::Result<()> {
                Reporter::on_attachment(&mut self.recorder, p, m, t, artifact).await
            }

            async fn on_end(&mut self, p: String, m: String, t: String, test: Test) -> eyre::Result<()> {
                Reporter::on_end(&mut self.recorder, p, m, t, test).await
            }

            async fn on_finish(&mut self) -> eyre::Result<()> {
                let render: fn(&crate::report::Report) -> eyre::Result<String> = $render;
                let document = render(self.recorder.report())?;
                if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&self.path, document)
                    .await
                    .wrap_err_with(|| format!("failed to write {} report to {:?}", $format, self.path))?;
                info!("{} report written to {:?}", $format, self.path);
                Ok(())
            }
        }
    };
}

delegate_to_recorder!(HtmlReporter, |report| Ok(report.to_html()), "html");
delegate_to_recorder!(JsonReporter, |report| report.to_json(), "json");
