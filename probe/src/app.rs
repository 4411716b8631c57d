use clap::{Arg, ArgAction, Command as ClapCommand};
use console::Term;
use eyre::OptionExt;
use itertools::Itertools;
use probe_core::{report::DuplicatePolicy, runner::TestIgnoreFilter, Filter};
use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::{
    load_probe_config, HtmlReporter, JsonReporter, ListReporter, NullReporter, Reporter,
    ReporterType,
};

type BoxedReporter = Box<dyn Reporter + 'static + Send>;

/// Build the CLI with clap's builder pattern
fn build_cli<'a>(third_party_reporters: impl Iterator<Item = &'a String>) -> ClapCommand {
    let mut reporter_choices: VecDeque<_> = third_party_reporters.map(|s| s.to_string()).collect();
    for builtin in [
        ReporterType::Null,
        ReporterType::Json,
        ReporterType::Html,
        ReporterType::List,
    ] {
        reporter_choices.push_front(builtin.to_string());
    }
    ClapCommand::new("probe")
        .about("probe runs API and browser tests against a staging environment and reports the results")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .subcommand(
            ClapCommand::new("test")
                .about("Run tests")
                .arg(Arg::new("capture-http")
                    .long("capture-http")
                    .help("Print the masked HTTP calls of every test")
                    .action(ArgAction::SetTrue))
                .arg(Arg::new("capture-rust")
                    .long("capture-rust")
                    .help("Print probe's internal logs, filtered by RUST_LOG")
                    .action(ArgAction::SetTrue))
                .arg(Arg::new("projects")
                    .short('p')
                    .long("projects")
                    .help("Specify projects to run in comma-separated string. --projects staging")
                    .value_delimiter(',')
                    .action(ArgAction::Append))
                .arg(Arg::new("modules")
                    .short('m')
                    .long("modules")
                    .help("Specify modules to run in comma-separated string. --modules api,ui")
                    .value_delimiter(',')
                    .action(ArgAction::Append))
                .arg(Arg::new("tests")
                    .short('t')
                    .long("tests")
                    .help("Specify test cases to run in comma-separated string. e.g. --tests a,b")
                    .value_delimiter(',')
                    .action(ArgAction::Append))
                .arg(Arg::new("reporters")
                    .long("reporters")
                    .help(format!("Specify the reporters to use in comma-separated string. Default is \"list\". [possible values: {}]", reporter_choices.into_iter().join(", ")))
                    .value_delimiter(',')
                    .action(ArgAction::Append))
                .arg(Arg::new("report-path")
                    .long("report-path")
                    .help("Where the html reporter writes its document. The json reporter uses the same path with a .json extension. Default is [report].path of probe.toml"))
                .arg(Arg::new("color")
                    .long("color")
                    .help("Produce color output. Default is \"auto\" [env: CARGO_TERM_COLOR]")
                    .value_parser(["auto", "always", "never"]))
        )
        .subcommand(
            ClapCommand::new("ls")
                .about("List test cases")
        )
}

/// probe CLI.
#[derive(Default)]
pub struct App {
    third_party_reporters: HashMap<String, BoxedReporter>,
}

impl App {
    pub fn new() -> App {
        App {
            third_party_reporters: HashMap::new(),
        }
    }

    /// Install a third-party reporter.
    pub fn install_reporter(
        &mut self,
        name: impl Into<String>,
        reporter: impl Reporter + 'static + Send,
    ) {
        self.third_party_reporters
            .insert(name.into(), Box::new(reporter));
    }

    /// Parse command-line args and run probe CLI sub command. Returns an error, and
    /// therefore a non-zero exit code, when the configuration cannot be loaded or any
    /// selected test fails.
    pub async fn run(mut self, mut runner: crate::Runner) -> eyre::Result<()> {
        let matches = build_cli(self.third_party_reporters.keys()).get_matches();
        color_eyre::install()?;

        let cfg = load_probe_config()?;
        let term = Term::stdout();

        match matches.subcommand() {
            Some(("test", test_matches)) => {
                let capture_http = test_matches.get_flag("capture-http");
                let capture_rust = test_matches.get_flag("capture-rust");
                let projects = values(test_matches, "projects");
                let modules = values(test_matches, "modules");
                let tests = values(test_matches, "tests");
                let reporters_arg = test_matches
                    .get_many::<String>("reporters")
                    .map(|vals| vals.cloned().collect::<Vec<_>>())
                    .unwrap_or_else(|| vec![ReporterType::List.to_string()]);
                let report_path = test_matches
                    .get_one::<String>("report-path")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(&cfg.report.path));
                let color_command = test_matches
                    .get_one::<String>("color")
                    .and_then(|s| Color::from_str(s).ok());

                if capture_http {
                    runner.capture_http();
                }
                if capture_rust {
                    runner.capture_rust();
                }

                let mut reporters = std::mem::take(&mut self.third_party_reporters);
                reporters.extend(builtin_reporters(
                    capture_http,
                    &cfg.report.title,
                    &report_path,
                    cfg.report.duplicates,
                ));

                for reporter in reporters_arg {
                    runner.add_boxed_reporter(
                        reporters
                            .remove(&reporter)
                            .ok_or_else(|| eyre::eyre!("Unknown reporter: {reporter}"))?,
                    );
                }

                let color_env = std::env::var("CARGO_TERM_COLOR");
                let color = match (color_command, color_env) {
                    (color @ Some(Color::Always), _) => color,
                    (color @ Some(Color::Never), _) => color,
                    (None, Ok(color)) => Color::from_str(&color).ok(),
                    _ => None,
                };
                match color {
                    Some(Color::Always) => {
                        console::set_colors_enabled(true);
                        console::set_colors_enabled_stderr(true);
                    }
                    Some(Color::Never) => {
                        console::set_colors_enabled(false);
                        console::set_colors_enabled_stderr(false);
                    }
                    _ => {}
                }

                runner.run(&projects, &modules, &tests).await
            }
            Some(("ls", _)) => {
                let filter = TestIgnoreFilter::from_config(cfg);
                let list = runner.list();
                let test_case_by_module = list.iter().into_group_map_by(|test| test.module.clone());
                for module in test_case_by_module.keys().sorted() {
                    term.write_line(&format!("* {module}"))?;
                    for project in &cfg.projects {
                        for test_case in test_case_by_module
                            .get(module)
                            .ok_or_eyre("module not found")?
                        {
                            if !filter.filter(project, test_case) {
                                continue;
                            }
                            let serial = test_case
                                .serial_group
                                .as_deref()
                                .map(|group| format!(" (serial: {group})"))
                                .unwrap_or_default();
                            term.write_line(&format!(
                                "  - [{}] {}{serial}",
                                project.name,
                                test_case.full_name()
                            ))?;
                        }
                    }
                }

                Ok(())
            }
            _ => unreachable!("Subcommand required is set to true"),
        }
    }
}

fn values(matches: &clap::ArgMatches, id: &str) -> Vec<String> {
    matches
        .get_many::<String>(id)
        .map(|vals| vals.cloned().collect::<Vec<_>>())
        .unwrap_or_default()
}

fn builtin_reporters(
    capture_http: bool,
    title: &str,
    report_path: &Path,
    policy: DuplicatePolicy,
) -> [(String, BoxedReporter); 4] {
    [
        (
            ReporterType::List.to_string(),
            Box::new(ListReporter::new(capture_http)) as BoxedReporter,
        ),
        (
            ReporterType::Html.to_string(),
            Box::new(HtmlReporter::new(title, report_path, policy)) as BoxedReporter,
        ),
        (
            ReporterType::Json.to_string(),
            Box::new(JsonReporter::new(
                title,
                report_path.with_extension("json"),
                policy,
            )) as BoxedReporter,
        ),
        (
            ReporterType::Null.to_string(),
            Box::new(NullReporter) as BoxedReporter,
        ),
    ]
}

#[derive(Debug, Clone, Default, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Color {
    #[default]
    Auto,
    Always,
    Never,
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cli_parses_test_subcommand() {
        let no_custom = Vec::<String>::new();
        let matches = build_cli(no_custom.iter())
            .try_get_matches_from([
                "probe",
                "test",
                "-p",
                "staging",
                "-m",
                "api,ui",
                "--reporters",
                "list,html",
                "--report-path",
                "out/report.html",
            ])
            .unwrap();
        let (name, test) = matches.subcommand().unwrap();
        assert_eq!(name, "test");
        assert_eq!(values(test, "projects"), vec!["staging"]);
        assert_eq!(values(test, "modules"), vec!["api", "ui"]);
        assert_eq!(values(test, "reporters"), vec!["list", "html"]);
        assert_eq!(
            test.get_one::<String>("report-path").map(String::as_str),
            Some("out/report.html")
        );
    }

    #[test]
    fn cli_requires_a_subcommand() {
        let no_custom = Vec::<String>::new();
        assert!(build_cli(no_custom.iter())
            .try_get_matches_from(["probe"])
            .is_err());
    }

    #[test]
    fn builtin_reporters_cover_every_type() {
        let names: Vec<_> = builtin_reporters(
            false,
            "Website Test Report",
            Path::new("report.html"),
            DuplicatePolicy::Keep,
        )
        .into_iter()
        .map(|(name, _)| name)
        .sorted()
        .collect();
        assert_eq!(names, vec!["html", "json", "list", "null"]);
    }
}
