//! Framework adapter that drives a Node runner script
//!
//! The runner is started once per source:
//!
//! ```text
//! <node> <script> --framework <id> --mode run|discover --source <path> [--test <fqn>]...
//! ```
//!
//! and reports on stdout with one JSON object per line:
//!
//! ```text
//! {"event":"testFound","fullyQualifiedName":"math add","displayName":"add","file":"math.js","line":3}
//! {"event":"testStart","fullyQualifiedName":"math add"}
//! {"event":"testEnd","fullyQualifiedName":"math add","outcome":"passed","durationMs":4}
//! {"event":"log","level":"warning","message":"deprecated API"}
//! ```
//!
//! Any other stdout line is forwarded as informational output. A non-zero
//! exit is a framework fault carrying the runner's stderr.

use super::{FrameworkEvent, FrameworkFactory, FrameworkListener, TestFramework};
use crate::protocol::{MessageLevel, TestCase, TestOutcome, TestResult};
use crate::result::{TestHostError, TestHostResult};
use crate::settings::{RunnerSettings, TestFrameworkKind};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, trace};

/// Environment variable carrying the coverage dump directory to the runner
pub const COVERAGE_DIR_ENV: &str = "PROBAR_TESTHOST_COVERAGE_DIR";

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
enum RunnerLine {
    #[serde(rename_all = "camelCase")]
    TestFound {
        fully_qualified_name: String,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        file: Option<String>,
        #[serde(default)]
        line: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    TestStart { fully_qualified_name: String },
    #[serde(rename_all = "camelCase")]
    TestEnd {
        fully_qualified_name: String,
        outcome: String,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        error_message: Option<String>,
        #[serde(default)]
        error_stack: Option<String>,
    },
    Log {
        #[serde(default)]
        level: Option<String>,
        message: String,
    },
}

fn parse_outcome(outcome: &str) -> TestOutcome {
    match outcome.to_ascii_lowercase().as_str() {
        "passed" | "pass" => TestOutcome::Passed,
        "failed" | "fail" => TestOutcome::Failed,
        "skipped" | "pending" | "disabled" | "excluded" => TestOutcome::Skipped,
        "notfound" => TestOutcome::NotFound,
        _ => TestOutcome::None,
    }
}

fn parse_level(level: Option<&str>) -> MessageLevel {
    match level.map(str::to_ascii_lowercase).as_deref() {
        Some("error") => MessageLevel::Error,
        Some("warn" | "warning") => MessageLevel::Warning,
        _ => MessageLevel::Informational,
    }
}

/// Turns runner stdout into framework events for one source
struct EventParser {
    source: String,
    known: HashMap<String, TestCase>,
}

impl EventParser {
    fn new(source: &str, requested: &[TestCase]) -> Self {
        Self {
            source: source.to_string(),
            known: requested
                .iter()
                .map(|tc| (tc.fully_qualified_name.clone(), tc.clone()))
                .collect(),
        }
    }

    fn case(&self, fqn: String) -> TestCase {
        self.known
            .get(&fqn)
            .cloned()
            .unwrap_or_else(|| TestCase::new(self.source.clone(), fqn))
    }

    fn parse(&mut self, line: &str) -> Option<FrameworkEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let parsed = if trimmed.starts_with('{') {
            serde_json::from_str::<RunnerLine>(trimmed).ok()
        } else {
            None
        };
        let Some(parsed) = parsed else {
            return Some(FrameworkEvent::Log {
                level: MessageLevel::Informational,
                message: trimmed.to_string(),
            });
        };

        Some(match parsed {
            RunnerLine::TestFound {
                fully_qualified_name,
                display_name,
                file,
                line,
            } => {
                let mut tc = TestCase::new(self.source.clone(), fully_qualified_name.clone());
                if let Some(name) = display_name {
                    tc = tc.with_display_name(name);
                }
                if let Some(file) = file {
                    tc = tc.with_location(file, line.unwrap_or(0));
                }
                self.known.insert(fully_qualified_name, tc.clone());
                FrameworkEvent::TestCaseFound(tc)
            }
            RunnerLine::TestStart {
                fully_qualified_name,
            } => FrameworkEvent::TestCaseStart(self.case(fully_qualified_name)),
            RunnerLine::TestEnd {
                fully_qualified_name,
                outcome,
                duration_ms,
                error_message,
                error_stack,
            } => {
                let mut result = TestResult::new(self.case(fully_qualified_name), parse_outcome(&outcome))
                    .with_duration(Duration::from_millis(duration_ms));
                if let Some(message) = error_message {
                    result = result.with_error(message, error_stack);
                }
                FrameworkEvent::TestCaseEnd(result)
            }
            RunnerLine::Log { level, message } => FrameworkEvent::Log {
                level: parse_level(level.as_deref()),
                message,
            },
        })
    }
}

/// Runs tests through an external Node process
#[derive(Debug, Clone)]
pub struct ExternalRunner {
    kind: TestFrameworkKind,
    node: PathBuf,
    script: PathBuf,
    coverage_dir: Option<PathBuf>,
}

impl ExternalRunner {
    /// Runner for `kind` using `node` and `script`
    #[must_use]
    pub fn new(kind: TestFrameworkKind, node: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            node: node.into(),
            script: script.into(),
            coverage_dir: None,
        }
    }

    /// Ask the runner to write coverage dumps into `dir`
    #[must_use]
    pub fn with_coverage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.coverage_dir = Some(dir.into());
        self
    }

    fn command(&self, mode: &str, source: &str, tests: &[TestCase]) -> Command {
        let mut cmd = Command::new(&self.node);
        cmd.arg(&self.script)
            .arg("--framework")
            .arg(self.kind.as_str())
            .arg("--mode")
            .arg(mode)
            .arg("--source")
            .arg(source);
        for tc in tests {
            cmd.arg("--test").arg(&tc.fully_qualified_name);
        }
        if let Some(dir) = &self.coverage_dir {
            cmd.env(COVERAGE_DIR_ENV, dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn invoke(
        &self,
        mode: &str,
        source: &str,
        tests: &[TestCase],
        listener: &dyn FrameworkListener,
    ) -> TestHostResult<()> {
        debug!(framework = %self.kind, mode, source, "starting runner");
        let mut child = self.command(mode, source, tests).spawn().map_err(|e| {
            TestHostError::framework(format!(
                "failed to start {}: {e}. Is Node installed?",
                self.node.display()
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TestHostError::framework("runner stdout unavailable"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| TestHostError::framework("runner stderr unavailable"))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        // Runners may write raw bytes; decode lossily so later results survive
        let mut parser = EventParser::new(source, tests);
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            trace!(source, line = %line.trim_end(), "runner output");
            if let Some(event) = parser.parse(&line) {
                listener.on_event(event);
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(TestHostError::framework(format!(
                "{} runner for {source} exited with {status}: {}",
                self.kind,
                stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl TestFramework for ExternalRunner {
    fn kind(&self) -> TestFrameworkKind {
        self.kind
    }

    async fn discover(&self, source: &str, listener: &dyn FrameworkListener) -> TestHostResult<()> {
        self.invoke("discover", source, &[], listener).await
    }

    async fn run(
        &self,
        source: &str,
        tests: &[TestCase],
        listener: &dyn FrameworkListener,
    ) -> TestHostResult<()> {
        self.invoke("run", source, tests, listener).await
    }
}

/// Builds [`ExternalRunner`]s from runner settings
#[derive(Debug, Clone)]
pub struct ExternalRunnerFactory {
    runner: RunnerSettings,
    coverage_dump_dir: PathBuf,
}

impl ExternalRunnerFactory {
    /// Factory over runner settings and the coverage dump directory
    #[must_use]
    pub fn new(runner: RunnerSettings, coverage_dump_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            coverage_dump_dir: coverage_dump_dir.into(),
        }
    }
}

impl FrameworkFactory for ExternalRunnerFactory {
    fn create(&self, kind: TestFrameworkKind, coverage: bool) -> TestHostResult<Arc<dyn TestFramework>> {
        let script = self.runner.script.as_ref().ok_or_else(|| {
            TestHostError::config(format!("no runner script configured for {kind}"))
        })?;
        let mut runner = ExternalRunner::new(kind, &self.runner.node, script);
        if coverage {
            runner = runner.with_coverage_dir(&self.coverage_dump_dir);
        }
        Ok(Arc::new(runner))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<FrameworkEvent>>);

    impl FrameworkListener for Collect {
        fn on_event(&self, event: FrameworkEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    // =========================================================================
    // Line parsing
    // =========================================================================

    #[test]
    fn test_parse_found_then_end_keeps_location() {
        let mut parser = EventParser::new("math.js", &[]);
        let found = parser
            .parse(r#"{"event":"testFound","fullyQualifiedName":"math add","displayName":"add","file":"math.js","line":3}"#)
            .unwrap();
        let FrameworkEvent::TestCaseFound(tc) = found else {
            panic!("expected TestCaseFound");
        };
        assert_eq!(tc.display_name, "add");
        assert_eq!(tc.line_number, Some(3));

        let end = parser
            .parse(r#"{"event":"testEnd","fullyQualifiedName":"math add","outcome":"failed","durationMs":7,"errorMessage":"expected 3"}"#)
            .unwrap();
        let FrameworkEvent::TestCaseEnd(result) = end else {
            panic!("expected TestCaseEnd");
        };
        assert_eq!(result.test_case, tc);
        assert_eq!(result.outcome, TestOutcome::Failed);
        assert_eq!(result.duration, Duration::from_millis(7));
        assert_eq!(result.error_message.as_deref(), Some("expected 3"));
    }

    #[test]
    fn test_parse_start_uses_requested_case() {
        let requested = TestCase::new("a.js", "suite t").with_display_name("t");
        let mut parser = EventParser::new("a.js", std::slice::from_ref(&requested));
        let event = parser
            .parse(r#"{"event":"testStart","fullyQualifiedName":"suite t"}"#)
            .unwrap();
        assert_eq!(event, FrameworkEvent::TestCaseStart(requested));
    }

    #[test]
    fn test_parse_plain_and_log_lines() {
        let mut parser = EventParser::new("a.js", &[]);
        assert_eq!(
            parser.parse("  1 passing (4ms)  "),
            Some(FrameworkEvent::Log {
                level: MessageLevel::Informational,
                message: "1 passing (4ms)".to_string()
            })
        );
        assert_eq!(
            parser.parse(r#"{"event":"log","level":"warning","message":"slow"}"#),
            Some(FrameworkEvent::Log {
                level: MessageLevel::Warning,
                message: "slow".to_string()
            })
        );
        assert!(parser.parse("   ").is_none());
        // Unknown JSON shapes fall back to plain output
        assert!(matches!(
            parser.parse(r#"{"event":"mystery"}"#),
            Some(FrameworkEvent::Log { .. })
        ));
    }

    #[test]
    fn test_outcome_mapping() {
        assert_eq!(parse_outcome("passed"), TestOutcome::Passed);
        assert_eq!(parse_outcome("FAILED"), TestOutcome::Failed);
        assert_eq!(parse_outcome("pending"), TestOutcome::Skipped);
        assert_eq!(parse_outcome("notFound"), TestOutcome::NotFound);
        assert_eq!(parse_outcome("weird"), TestOutcome::None);
    }

    // =========================================================================
    // Factory
    // =========================================================================

    #[test]
    fn test_factory_requires_script() {
        let factory = ExternalRunnerFactory::new(RunnerSettings::default(), "dumps");
        assert!(matches!(
            factory.create(TestFrameworkKind::Mocha, false),
            Err(TestHostError::Config { .. })
        ));
    }

    #[test]
    fn test_factory_builds_runner() {
        let runner = RunnerSettings {
            node: PathBuf::from("node"),
            script: Some(PathBuf::from("runner.js")),
        };
        let factory = ExternalRunnerFactory::new(runner, "dumps");
        let framework = factory.create(TestFrameworkKind::Jest, true).unwrap();
        assert_eq!(framework.kind(), TestFrameworkKind::Jest);
    }

    // =========================================================================
    // Process
    // =========================================================================

    #[tokio::test]
    async fn test_missing_executable_is_framework_error() {
        let runner = ExternalRunner::new(
            TestFrameworkKind::Mocha,
            "/nonexistent/probar-node",
            "runner.js",
        );
        let listener = Collect::default();
        let err = runner.discover("a.js", &listener).await.unwrap_err();
        assert!(matches!(err, TestHostError::Framework { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_script_and_streams_events() {
        let temp = tempfile::tempdir().unwrap();
        let script = temp.path().join("runner.sh");
        std::fs::write(
            &script,
            r#"echo "args: $*"
echo "coverage: $PROBAR_TESTHOST_COVERAGE_DIR"
echo '{"event":"testStart","fullyQualifiedName":"s t"}'
echo '{"event":"testEnd","fullyQualifiedName":"s t","outcome":"passed","durationMs":1}'
"#,
        )
        .unwrap();

        let runner = ExternalRunner::new(TestFrameworkKind::Jasmine, "sh", &script)
            .with_coverage_dir("/tmp/dumps");
        let listener = Collect::default();
        runner
            .run("spec.js", &[TestCase::new("spec.js", "s t")], &listener)
            .await
            .unwrap();

        let events = listener.0.lock().unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            FrameworkEvent::Log {
                level: MessageLevel::Informational,
                message: "args: --framework jasmine --mode run --source spec.js --test s t".to_string()
            }
        );
        assert_eq!(
            events[1],
            FrameworkEvent::Log {
                level: MessageLevel::Informational,
                message: "coverage: /tmp/dumps".to_string()
            }
        );
        assert!(matches!(&events[3], FrameworkEvent::TestCaseEnd(r) if r.outcome == TestOutcome::Passed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_utf8_output_does_not_drop_later_results() {
        let temp = tempfile::tempdir().unwrap();
        let script = temp.path().join("runner.sh");
        std::fs::write(
            &script,
            r#"echo '{"event":"testEnd","fullyQualifiedName":"a","outcome":"passed"}'
printf '\377\376\n'
echo '{"event":"testEnd","fullyQualifiedName":"b","outcome":"failed"}'
"#,
        )
        .unwrap();

        let runner = ExternalRunner::new(TestFrameworkKind::Mocha, "sh", &script);
        let listener = Collect::default();
        runner.run("spec.js", &[], &listener).await.unwrap();

        let events = listener.0.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], FrameworkEvent::TestCaseEnd(r) if r.test_case.fully_qualified_name == "a"));
        assert!(matches!(&events[1], FrameworkEvent::Log { message, .. } if message.contains('\u{FFFD}')));
        assert!(matches!(
            &events[2],
            FrameworkEvent::TestCaseEnd(r)
                if r.test_case.fully_qualified_name == "b" && r.outcome == TestOutcome::Failed
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let temp = tempfile::tempdir().unwrap();
        let script = temp.path().join("runner.sh");
        std::fs::write(&script, "echo 'Cannot find module chai' >&2\nexit 3\n").unwrap();

        let runner = ExternalRunner::new(TestFrameworkKind::Mocha, "sh", &script);
        let err = runner
            .discover("a.js", &Collect::default())
            .await
            .unwrap_err();
        let TestHostError::Framework { message } = err else {
            panic!("expected framework error");
        };
        assert!(message.contains("Cannot find module chai"));
    }
}
