use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::coverage::{CoverageFormat, RawCoverage};
use crate::error::{Error, Result};
use crate::process::{ProcessConfig, spawn_and_stream};

/// Id of the synthetic outcome used when the runner reports no per-test results.
pub const SUITE_TEST_ID: &str = "suite";

const DIAGNOSTIC_TAIL_LINES: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed(String),
    Errored(String),
    Skipped,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Passed => write!(f, "passed"),
            TestStatus::Failed(_) => write!(f, "failed"),
            TestStatus::Errored(_) => write!(f, "errored"),
            TestStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of one test. `diagnostic` is passed to the repair agent as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub id: String,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl TestOutcome {
    pub fn passed(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: TestStatus::Passed,
            diagnostic: None,
        }
    }

    pub fn failed(id: &str, reason: &str, diagnostic: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            status: TestStatus::Failed(reason.to_string()),
            diagnostic: diagnostic.map(str::to_string),
        }
    }

    pub fn is_failing(&self) -> bool {
        matches!(self.status, TestStatus::Failed(_) | TestStatus::Errored(_))
    }

    /// Stable description of how the test fails, used to tell a repeated
    /// failure apart from a new one.
    pub fn signature(&self) -> String {
        match &self.status {
            TestStatus::Failed(reason) => format!("failed: {}", first_line(reason)),
            TestStatus::Errored(reason) => format!("errored: {}", first_line(reason)),
            other => other.to_string(),
        }
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("").trim()
}

/// Outcomes plus raw coverage from one test run.
#[derive(Debug, Clone, Default)]
pub struct TestRun {
    pub outcomes: Vec<TestOutcome>,
    pub coverage: RawCoverage,
}

impl TestRun {
    pub fn failing(&self) -> impl Iterator<Item = &TestOutcome> {
        self.outcomes.iter().filter(|o| o.is_failing())
    }
}

pub trait TestRunner {
    /// Run the suite, or the tests matching `selector`.
    ///
    /// Crashes unrelated to test content (compile failure, missing results)
    /// are `Error::Runner`, never a failing outcome.
    fn run(
        &self,
        selector: Option<&str>,
    ) -> impl std::future::Future<Output = Result<TestRun>> + Send;
}

#[derive(Debug, Deserialize)]
struct ResultRecord {
    id: String,
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

/// Runs a shell command that executes the tests and writes a coverage file
/// (and optionally a JSON results file) into the working directory.
pub struct CommandTestRunner {
    command: String,
    working_dir: PathBuf,
    coverage_file: String,
    coverage_format: CoverageFormat,
    results_file: Option<String>,
    timeout: Option<Duration>,
}

impl CommandTestRunner {
    pub fn new(config: &RunnerConfig, working_dir: PathBuf) -> Self {
        Self {
            command: config.command.clone(),
            working_dir,
            coverage_file: config.coverage_file.clone(),
            coverage_format: config.coverage_format,
            results_file: config.results_file.clone(),
            timeout: config.timeout.map(Duration::from_secs),
        }
    }

    /// The full shell command line, with the selector quoted as one argument.
    pub fn command_line(&self, selector: Option<&str>) -> String {
        match selector {
            Some(sel) if !sel.trim().is_empty() => {
                format!("{} {}", self.command, shell_quote(sel))
            }
            _ => self.command.clone(),
        }
    }

    fn remove_stale(&self, name: &str) -> Result<()> {
        let path = self.working_dir.join(name);
        if path.exists() {
            debug!(path = %path.display(), "removing stale runner output");
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn read_coverage(&self) -> Result<Option<RawCoverage>> {
        let path = self.working_dir.join(&self.coverage_file);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        RawCoverage::parse(self.coverage_format, &content).map(Some)
    }
}

impl TestRunner for CommandTestRunner {
    async fn run(&self, selector: Option<&str>) -> Result<TestRun> {
        self.remove_stale(&self.coverage_file)?;
        if let Some(ref results) = self.results_file {
            self.remove_stale(results)?;
        }

        let mut config = ProcessConfig::shell(
            &self.command_line(selector),
            self.working_dir.clone(),
            "tests",
        );
        config.timeout = self.timeout;

        info!(command = %config.args[1], dir = %self.working_dir.display(), "running tests");
        let output = spawn_and_stream(config).await?;

        if let Some(sig) = output.signal {
            return Err(Error::Process(format!("test command killed by signal {sig}")));
        }

        let coverage = self.read_coverage()?;

        let outcomes = match self.results_file {
            Some(ref results) => {
                let path = self.working_dir.join(results);
                if !path.exists() {
                    return Err(Error::Runner {
                        exit_code: output.exit_code,
                        stderr: output.stderr_tail(DIAGNOSTIC_TAIL_LINES),
                    });
                }
                parse_results(&std::fs::read_to_string(&path)?)?
            }
            None if output.success() => vec![TestOutcome::passed(SUITE_TEST_ID)],
            None => {
                if coverage.is_none() {
                    return Err(Error::Runner {
                        exit_code: output.exit_code,
                        stderr: output.stderr_tail(DIAGNOSTIC_TAIL_LINES),
                    });
                }
                let diagnostic = format!(
                    "{}\n{}",
                    tail(&output.stdout_lines, DIAGNOSTIC_TAIL_LINES),
                    output.stderr_tail(DIAGNOSTIC_TAIL_LINES)
                );
                vec![TestOutcome::failed(
                    SUITE_TEST_ID,
                    &format!("test command exited with code {}", output.exit_code),
                    Some(diagnostic.trim()),
                )]
            }
        };

        let coverage = coverage.unwrap_or_else(|| {
            warn!(
                file = %self.coverage_file,
                "test command produced no coverage file; treating every line as uncovered"
            );
            RawCoverage::new()
        });

        let failing = outcomes.iter().filter(|o| o.is_failing()).count();
        info!(tests = outcomes.len(), failing, "test run finished");

        Ok(TestRun { outcomes, coverage })
    }
}

/// Parse `[{"id", "status", "message"?, "details"?}]`.
pub fn parse_results(content: &str) -> Result<Vec<TestOutcome>> {
    let records: Vec<ResultRecord> = serde_json::from_str(content).map_err(|e| {
        Error::Runner {
            exit_code: 0,
            stderr: format!("malformed test results file: {e}"),
        }
    })?;

    records
        .into_iter()
        .map(|r| {
            let reason = r.message.unwrap_or_default();
            let status = match r.status.as_str() {
                "passed" | "pass" | "ok" => TestStatus::Passed,
                "failed" | "fail" => TestStatus::Failed(reason),
                "errored" | "error" => TestStatus::Errored(reason),
                "skipped" | "skip" | "ignored" => TestStatus::Skipped,
                other => {
                    return Err(Error::Runner {
                        exit_code: 0,
                        stderr: format!("unknown test status '{other}' for {}", r.id),
                    });
                }
            };
            Ok(TestOutcome {
                id: r.id,
                status,
                diagnostic: r.details,
            })
        })
        .collect()
}

fn tail(lines: &[String], max: usize) -> String {
    let skip = lines.len().saturating_sub(max);
    lines[skip..].join("\n")
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;

    fn runner_config(command: &str) -> RunnerConfig {
        RunnerConfig {
            command: command.to_string(),
            coverage_file: "lcov.info".to_string(),
            coverage_format: CoverageFormat::Lcov,
            results_file: None,
            timeout: Some(30),
            retries: 0,
            backoff_ms: 1,
        }
    }

    #[test]
    fn test_parse_results() {
        let json = r#"[
            {"id": "parser::ok", "status": "passed"},
            {"id": "parser::bad", "status": "failed", "message": "assertion failed", "details": "left: 1\nright: 2"},
            {"id": "parser::boom", "status": "errored", "message": "panicked"},
            {"id": "parser::later", "status": "skipped"}
        ]"#;
        let outcomes = parse_results(json).unwrap();
        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes[0].status, TestStatus::Passed);
        assert_eq!(
            outcomes[1].status,
            TestStatus::Failed("assertion failed".to_string())
        );
        assert_eq!(outcomes[1].diagnostic.as_deref(), Some("left: 1\nright: 2"));
        assert!(outcomes[2].is_failing());
        assert!(!outcomes[3].is_failing());
    }

    #[test]
    fn test_parse_results_unknown_status() {
        let err = parse_results(r#"[{"id": "x", "status": "flaky"}]"#).unwrap_err();
        assert!(matches!(err, Error::Runner { .. }));
    }

    #[test]
    fn test_signature_uses_first_line() {
        let a = TestOutcome::failed("t", "assert failed\nat line 3", None);
        let b = TestOutcome::failed("t", "assert failed\nat line 9", None);
        let c = TestOutcome::failed("t", "index out of bounds", None);
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn test_command_line_quotes_selector() {
        let runner = CommandTestRunner::new(&runner_config("cargo test"), PathBuf::from("."));
        assert_eq!(runner.command_line(None), "cargo test");
        assert_eq!(runner.command_line(Some("")), "cargo test");
        assert_eq!(
            runner.command_line(Some("parser::it's")),
            r"cargo test 'parser::it'\''s'"
        );
    }

    #[tokio::test]
    async fn test_run_passing_suite_reads_coverage() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = CommandTestRunner::new(
            &runner_config("printf 'SF:src/a.rs\\nDA:1,1\\nend_of_record\\n' > lcov.info"),
            dir.path().to_path_buf(),
        );
        let run = runner.run(None).await.unwrap();
        assert_eq!(run.outcomes, vec![TestOutcome::passed(SUITE_TEST_ID)]);
        assert!(!run.coverage.is_empty());
    }

    #[tokio::test]
    async fn test_run_crash_without_coverage_is_runner_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = CommandTestRunner::new(
            &runner_config("echo 'error[E0425]: cannot find value' >&2; exit 101"),
            dir.path().to_path_buf(),
        );
        match runner.run(None).await {
            Err(Error::Runner { exit_code, stderr }) => {
                assert_eq!(exit_code, 101);
                assert!(stderr.contains("E0425"));
            }
            other => panic!("expected runner error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_failing_suite_with_coverage_is_outcome() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = CommandTestRunner::new(
            &runner_config("echo 'SF:a.rs' > lcov.info; echo 'test x failed'; exit 1"),
            dir.path().to_path_buf(),
        );
        let run = runner.run(None).await.unwrap();
        assert_eq!(run.outcomes.len(), 1);
        assert!(run.outcomes[0].is_failing());
        assert!(
            run.outcomes[0]
                .diagnostic
                .as_deref()
                .unwrap()
                .contains("test x failed")
        );
    }

    #[tokio::test]
    async fn test_run_missing_results_file_is_runner_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = runner_config("true");
        config.results_file = Some("results.json".to_string());
        let runner = CommandTestRunner::new(&config, dir.path().to_path_buf());
        assert!(matches!(
            runner.run(None).await,
            Err(Error::Runner { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_removes_stale_coverage() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("lcov.info"),
            "SF:src/a.rs\nDA:1,1\nend_of_record\n",
        )
        .unwrap();
        let runner = CommandTestRunner::new(&runner_config("true"), dir.path().to_path_buf());
        let run = runner.run(None).await.unwrap();
        assert!(run.coverage.is_empty());
    }

    #[tokio::test]
    async fn test_run_reads_results_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = runner_config(
            r#"echo '[{"id":"a","status":"passed"},{"id":"b","status":"failed","message":"boom"}]' > results.json; exit 1"#,
        );
        config.results_file = Some("results.json".to_string());
        let runner = CommandTestRunner::new(&config, dir.path().to_path_buf());
        let run = runner.run(None).await.unwrap();
        assert_eq!(run.failing().count(), 1);
        assert_eq!(run.failing().next().unwrap().id, "b");
    }
}
