//! Execution and discovery managers
//!
//! Each request gets its own [`SessionOrchestrator`] with one session per
//! source. Session jobs drive the framework adapter, forward its events to
//! the controller and mark their session complete. Faulted sessions are
//! reported and completed by their error callback so the run always
//! finishes.

use crate::coverage::CoverageEngine;
use crate::framework::{FrameworkEvent, FrameworkFactory, FrameworkListener, TestFramework};
use crate::isolation::{ErrorCallback, Job};
use crate::protocol::{
    DiscoveryCompleteEventArgs, DiscoveryCriteria, MessageLevel, TestCase,
    TestExecutionCompletePayload, TestResult, TestRunChangedEventArgs, TestRunCompleteEventArgs,
    TestRunCriteriaWithSources, TestRunCriteriaWithTests, TestRunStatistics,
};
use crate::result::TestHostResult;
use crate::sender::MessageSender;
use crate::session::{
    CoverageContext, PendingSession, SessionOrchestrator, SessionResult, SessionStatus,
};
use crate::settings::{RunSettings, Settings};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

fn report(outcome: TestHostResult<()>) {
    if let Err(e) = outcome {
        warn!(error = %e, "failed to report progress");
    }
}

fn dedup_sources(sources: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    sources
        .into_iter()
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

/// Group tests by source, sources in order of first appearance
fn group_by_source(tests: Vec<TestCase>) -> Vec<(String, Vec<TestCase>)> {
    let mut groups: Vec<(String, Vec<TestCase>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for tc in tests {
        match index.get(&tc.source).and_then(|&i| groups.get_mut(i)) {
            Some((_, group)) => group.push(tc),
            None => {
                index.insert(tc.source.clone(), groups.len());
                groups.push((tc.source.clone(), vec![tc]));
            }
        }
    }
    groups
}

/// Error callback shared by both managers: report, then complete as faulted
fn fault_callback(
    orchestrator: &SessionOrchestrator,
    sender: &MessageSender,
    source: String,
) -> ErrorCallback {
    let orchestrator = orchestrator.clone();
    let sender = sender.clone();
    Box::new(move |err| {
        warn!(%source, error = %err, "session faulted");
        report(sender.send_message(MessageLevel::Error, format!("{source}: {err}")));
        let previous = orchestrator
            .get_result_args(&source)
            .unwrap_or_else(|| SessionResult::running(source.clone()));
        report(orchestrator.set_session_complete(SessionResult {
            status: SessionStatus::Faulted,
            error: Some(err.to_string()),
            ..previous
        }));
    })
}

// =============================================================================
// Execution
// =============================================================================

/// Runs tests for an execution request
#[derive(Clone)]
pub struct ExecutionManager {
    settings: Arc<Settings>,
    sender: MessageSender,
    frameworks: Arc<dyn FrameworkFactory>,
    coverage_engine: Option<Arc<dyn CoverageEngine>>,
}

impl std::fmt::Debug for ExecutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionManager")
            .field("framework", &self.settings.test_framework)
            .field("coverage_engine", &self.coverage_engine.is_some())
            .finish_non_exhaustive()
    }
}

impl ExecutionManager {
    /// Create a manager
    #[must_use]
    pub fn new(
        settings: Arc<Settings>,
        sender: MessageSender,
        frameworks: Arc<dyn FrameworkFactory>,
        coverage_engine: Option<Arc<dyn CoverageEngine>>,
    ) -> Self {
        Self {
            settings,
            sender,
            frameworks,
            coverage_engine,
        }
    }

    /// Run every test in each source
    pub async fn start_test_run_with_sources(self, criteria: TestRunCriteriaWithSources) -> TestHostResult<()> {
        let units = dedup_sources(criteria.sources)
            .into_iter()
            .map(|source| (source, Vec::new()))
            .collect();
        self.execute(units, &criteria.run_settings).await
    }

    /// Run the given tests, one session per source
    pub async fn start_test_run_with_tests(self, criteria: TestRunCriteriaWithTests) -> TestHostResult<()> {
        let units = group_by_source(criteria.tests);
        self.execute(units, &criteria.run_settings).await
    }

    async fn execute(self, units: Vec<(String, Vec<TestCase>)>, run_settings_xml: &str) -> TestHostResult<()> {
        let started = Instant::now();
        let run_settings = RunSettings::from_xml(run_settings_xml);
        let coverage = run_settings.coverage_enabled(&self.settings);
        info!(sessions = units.len(), coverage, "starting test run");

        if units.is_empty() {
            return self.complete(TestRunStatistics::default(), None, started.elapsed());
        }

        let framework = match self.frameworks.create(self.settings.test_framework, coverage) {
            Ok(framework) => framework,
            Err(e) => {
                warn!(error = %e, "no test framework available");
                report(self.sender.send_message(MessageLevel::Error, e.to_string()));
                return self.complete(TestRunStatistics::default(), Some(e.to_string()), started.elapsed());
            }
        };

        let coverage_context = match (&self.coverage_engine, coverage) {
            (Some(engine), true) => Some(CoverageContext::new(
                engine.clone(),
                run_settings.coverage_output_dir(&self.settings),
            )),
            (None, true) => {
                warn!("coverage requested but no coverage engine is configured");
                None
            }
            (_, false) => None,
        };

        let (orchestrator, all_complete) = SessionOrchestrator::new(coverage_context);
        let totals = Arc::new(Mutex::new(TestRunStatistics::default()));
        let batch = units
            .into_iter()
            .map(|(source, tests)| {
                let job = self.session_job(&orchestrator, &framework, &totals, source.clone(), tests);
                let on_error = fault_callback(&orchestrator, &self.sender, source.clone());
                PendingSession::new(source, job, on_error)
            })
            .collect();
        orchestrator.add_sessions(batch)?;

        let summary = all_complete.wait().await?;
        debug!(sessions = summary.sessions, coverage_files = summary.coverage_files.len(), "test run finished");
        let statistics = totals.lock().unwrap_or_else(PoisonError::into_inner).clone();
        self.complete(statistics, None, started.elapsed())
    }

    fn session_job(
        &self,
        orchestrator: &SessionOrchestrator,
        framework: &Arc<dyn TestFramework>,
        totals: &Arc<Mutex<TestRunStatistics>>,
        source: String,
        tests: Vec<TestCase>,
    ) -> Job {
        let listener = ExecutionListener {
            source: source.clone(),
            sender: self.sender.clone(),
            orchestrator: orchestrator.clone(),
            totals: totals.clone(),
        };
        let orchestrator = orchestrator.clone();
        let framework = framework.clone();
        Box::pin(async move {
            framework.run(&source, &tests, &listener).await?;
            let statistics = orchestrator
                .get_result_args(&source)
                .map(|r| r.statistics)
                .unwrap_or_default();
            orchestrator.set_session_complete(SessionResult::completed(source).with_statistics(statistics))?;
            Ok(())
        })
    }

    fn complete(&self, statistics: TestRunStatistics, error: Option<String>, elapsed: Duration) -> TestHostResult<()> {
        info!(
            executed = statistics.executed_tests,
            aborted = error.is_some(),
            "test run complete"
        );
        self.sender.send_execution_complete(&TestExecutionCompletePayload {
            test_run_complete_args: TestRunCompleteEventArgs {
                test_run_statistics: statistics,
                is_canceled: false,
                is_aborted: error.is_some(),
                error,
                elapsed_time_in_running_tests: elapsed,
            },
            last_run_tests: None,
        })
    }
}

struct ExecutionListener {
    source: String,
    sender: MessageSender,
    orchestrator: SessionOrchestrator,
    totals: Arc<Mutex<TestRunStatistics>>,
}

impl ExecutionListener {
    fn record(&self, result: TestResult) {
        report(self.sender.send_test_case_end(&result));

        let mut session = self
            .orchestrator
            .get_result_args(&self.source)
            .map(|r| r.statistics)
            .unwrap_or_default();
        session.record(result.outcome);
        report(
            self.orchestrator
                .update_result_args(SessionResult::running(self.source.clone()).with_statistics(session)),
        );

        let cumulative = {
            let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
            totals.record(result.outcome);
            totals.clone()
        };
        report(self.sender.send_test_run_stats_change(&TestRunChangedEventArgs {
            new_test_results: vec![result],
            test_run_statistics: cumulative,
            active_tests: Vec::new(),
        }));
    }
}

impl FrameworkListener for ExecutionListener {
    fn on_event(&self, event: FrameworkEvent) {
        match event {
            FrameworkEvent::TestCaseFound(tc) => trace!(test = %tc.fully_qualified_name, "found during run"),
            FrameworkEvent::TestCaseStart(tc) => report(self.sender.send_test_case_start(&tc)),
            FrameworkEvent::TestCaseEnd(result) => self.record(result),
            FrameworkEvent::Log { level, message } => report(self.sender.send_message(level, message)),
        }
    }
}

// =============================================================================
// Discovery
// =============================================================================

/// Discovers tests for a discovery request
#[derive(Clone)]
pub struct DiscoveryManager {
    settings: Arc<Settings>,
    sender: MessageSender,
    frameworks: Arc<dyn FrameworkFactory>,
}

impl std::fmt::Debug for DiscoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryManager")
            .field("framework", &self.settings.test_framework)
            .finish_non_exhaustive()
    }
}

impl DiscoveryManager {
    /// Create a manager
    #[must_use]
    pub fn new(settings: Arc<Settings>, sender: MessageSender, frameworks: Arc<dyn FrameworkFactory>) -> Self {
        Self {
            settings,
            sender,
            frameworks,
        }
    }

    /// Discover the tests in every source
    pub async fn discover_tests(self, criteria: DiscoveryCriteria) -> TestHostResult<()> {
        let sources = dedup_sources(criteria.sources);
        info!(sessions = sources.len(), "starting discovery");
        if sources.is_empty() {
            return self.complete(0, false);
        }

        let framework = match self.frameworks.create(self.settings.test_framework, false) {
            Ok(framework) => framework,
            Err(e) => {
                warn!(error = %e, "no test framework available");
                report(self.sender.send_message(MessageLevel::Error, e.to_string()));
                return self.complete(0, true);
            }
        };

        let (orchestrator, all_complete) = SessionOrchestrator::new(None);
        let total = Arc::new(AtomicU64::new(0));
        let batch = sources
            .into_iter()
            .map(|source| {
                let listener = DiscoveryListener {
                    source: source.clone(),
                    sender: self.sender.clone(),
                    orchestrator: orchestrator.clone(),
                    total: total.clone(),
                };
                let job_orchestrator = orchestrator.clone();
                let job_framework = framework.clone();
                let job_source = source.clone();
                let job: Job = Box::pin(async move {
                    job_framework.discover(&job_source, &listener).await?;
                    let found = job_orchestrator
                        .get_result_args(&job_source)
                        .map_or(0, |r| r.discovered_tests);
                    job_orchestrator
                        .set_session_complete(SessionResult::completed(job_source).with_discovered_tests(found))?;
                    Ok(())
                });
                let on_error = fault_callback(&orchestrator, &self.sender, source.clone());
                PendingSession::new(source, job, on_error)
            })
            .collect();
        orchestrator.add_sessions(batch)?;

        all_complete.wait().await?;
        self.complete(total.load(Ordering::SeqCst), false)
    }

    fn complete(&self, total_tests: u64, is_aborted: bool) -> TestHostResult<()> {
        info!(total_tests, is_aborted, "discovery complete");
        self.sender.send_discovery_complete(&DiscoveryCompleteEventArgs {
            total_tests,
            last_discovered_tests: Vec::new(),
            is_aborted,
        })
    }
}

struct DiscoveryListener {
    source: String,
    sender: MessageSender,
    orchestrator: SessionOrchestrator,
    total: Arc<AtomicU64>,
}

impl FrameworkListener for DiscoveryListener {
    fn on_event(&self, event: FrameworkEvent) {
        match event {
            FrameworkEvent::TestCaseFound(tc) => {
                report(self.sender.send_test_cases_found(std::slice::from_ref(&tc)));
                self.total.fetch_add(1, Ordering::SeqCst);
                let found = self
                    .orchestrator
                    .get_result_args(&self.source)
                    .map_or(0, |r| r.discovered_tests);
                report(self.orchestrator.update_result_args(
                    SessionResult::running(self.source.clone()).with_discovered_tests(found + 1),
                ));
            }
            FrameworkEvent::TestCaseStart(_) | FrameworkEvent::TestCaseEnd(_) => {
                trace!(source = %self.source, "ignoring run event during discovery");
            }
            FrameworkEvent::Log { level, message } => report(self.sender.send_message(level, message)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::channel::{memory_channel, ControllerEnd};
    use crate::protocol::{Message, MessageType, TestMessagePayload, TestOutcome};
    use crate::result::TestHostError;
    use crate::settings::TestFrameworkKind;
    use async_trait::async_trait;

    /// What the scripted framework does for a source
    #[derive(Clone)]
    enum Script {
        Tests(Vec<(&'static str, TestOutcome)>),
        Fail(&'static str),
        Panic,
    }

    struct ScriptedFramework {
        scripts: HashMap<String, Script>,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl TestFramework for ScriptedFramework {
        fn kind(&self) -> TestFrameworkKind {
            TestFrameworkKind::Mocha
        }

        async fn discover(&self, source: &str, listener: &dyn FrameworkListener) -> TestHostResult<()> {
            match self.scripts.get(source).cloned() {
                Some(Script::Tests(tests)) => {
                    for (name, _) in tests {
                        listener.on_event(FrameworkEvent::TestCaseFound(TestCase::new(source, name)));
                    }
                    Ok(())
                }
                Some(Script::Fail(message)) => Err(TestHostError::framework(message)),
                Some(Script::Panic) => panic!("adapter blew up"),
                None => Ok(()),
            }
        }

        async fn run(
            &self,
            source: &str,
            tests: &[TestCase],
            listener: &dyn FrameworkListener,
        ) -> TestHostResult<()> {
            self.calls.lock().unwrap().push((
                source.to_string(),
                tests.iter().map(|t| t.fully_qualified_name.clone()).collect(),
            ));
            tokio::task::yield_now().await;
            match self.scripts.get(source).cloned() {
                Some(Script::Tests(tests)) => {
                    for (name, outcome) in tests {
                        let tc = TestCase::new(source, name);
                        listener.on_event(FrameworkEvent::TestCaseStart(tc.clone()));
                        listener.on_event(FrameworkEvent::TestCaseEnd(TestResult::new(tc, outcome)));
                    }
                    Ok(())
                }
                Some(Script::Fail(message)) => Err(TestHostError::framework(message)),
                Some(Script::Panic) => panic!("adapter blew up"),
                None => Ok(()),
            }
        }
    }

    struct Factory {
        framework: Option<Arc<ScriptedFramework>>,
    }

    impl FrameworkFactory for Factory {
        fn create(&self, _: TestFrameworkKind, _: bool) -> TestHostResult<Arc<dyn TestFramework>> {
            match &self.framework {
                Some(f) => Ok(f.clone()),
                None => Err(TestHostError::config("no runner script configured")),
            }
        }
    }

    fn scripted(scripts: Vec<(&str, Script)>) -> Arc<ScriptedFramework> {
        Arc::new(ScriptedFramework {
            scripts: scripts.into_iter().map(|(s, b)| (s.to_string(), b)).collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn execution(framework: Option<Arc<ScriptedFramework>>) -> (ExecutionManager, ControllerEnd) {
        let (_inbound, outbound, controller) = memory_channel();
        let manager = ExecutionManager::new(
            Arc::new(Settings::new(9000)),
            MessageSender::new(outbound, None),
            Arc::new(Factory { framework }),
            None,
        );
        (manager, controller)
    }

    fn discovery(framework: Option<Arc<ScriptedFramework>>) -> (DiscoveryManager, ControllerEnd) {
        let (_inbound, outbound, controller) = memory_channel();
        let manager = DiscoveryManager::new(
            Arc::new(Settings::new(9000)),
            MessageSender::new(outbound, None),
            Arc::new(Factory { framework }),
        );
        (manager, controller)
    }

    fn drain(controller: &mut ControllerEnd) -> Vec<Message> {
        std::iter::from_fn(|| controller.try_recv()).collect()
    }

    fn of_type(messages: &[Message], t: MessageType) -> Vec<&Message> {
        messages.iter().filter(|m| m.message_type == t).collect()
    }

    fn sources(list: &[&str]) -> TestRunCriteriaWithSources {
        TestRunCriteriaWithSources {
            sources: list.iter().map(ToString::to_string).collect(),
            run_settings: String::new(),
        }
    }

    // =========================================================================
    // Grouping
    // =========================================================================

    #[test]
    fn test_group_by_source_keeps_first_appearance_order() {
        let tests = vec![
            TestCase::new("b.js", "1"),
            TestCase::new("a.js", "2"),
            TestCase::new("b.js", "3"),
        ];
        let groups = group_by_source(tests);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "b.js");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "a.js");
    }

    #[test]
    fn test_dedup_sources() {
        let deduped = dedup_sources(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(deduped, vec!["a".to_string(), "b".to_string()]);
    }

    // =========================================================================
    // Execution
    // =========================================================================

    #[tokio::test]
    async fn test_run_with_sources_reports_each_result() {
        let framework = scripted(vec![
            ("a.js", Script::Tests(vec![("a1", TestOutcome::Passed), ("a2", TestOutcome::Failed)])),
            ("b.js", Script::Tests(vec![("b1", TestOutcome::Passed)])),
        ]);
        let (manager, mut controller) = execution(Some(framework.clone()));
        manager
            .start_test_run_with_sources(sources(&["a.js", "b.js"]))
            .await
            .unwrap();

        let messages = drain(&mut controller);
        let changes = of_type(&messages, MessageType::TestRunStatsChange);
        assert_eq!(changes.len(), 3);
        let last: TestRunChangedEventArgs = changes[2].payload_as().unwrap();
        assert_eq!(last.test_run_statistics.executed_tests, 3);

        let completed = of_type(&messages, MessageType::ExecutionComplete);
        assert_eq!(completed.len(), 1);
        assert_eq!(messages.last().unwrap().message_type, MessageType::ExecutionComplete);
        let payload: TestExecutionCompletePayload = completed[0].payload_as().unwrap();
        let stats = payload.test_run_complete_args.test_run_statistics;
        assert_eq!(stats.count(TestOutcome::Passed), 2);
        assert_eq!(stats.count(TestOutcome::Failed), 1);
        assert!(!payload.test_run_complete_args.is_aborted);

        let calls = framework.calls.lock().unwrap();
        assert_eq!(calls.iter().map(|c| c.0.as_str()).collect::<Vec<_>>(), vec!["a.js", "b.js"]);
    }

    #[tokio::test]
    async fn test_run_with_tests_groups_by_source() {
        let framework = scripted(vec![]);
        let (manager, _controller) = execution(Some(framework.clone()));
        manager
            .start_test_run_with_tests(TestRunCriteriaWithTests {
                tests: vec![
                    TestCase::new("a.js", "t1"),
                    TestCase::new("b.js", "t2"),
                    TestCase::new("a.js", "t3"),
                ],
                run_settings: String::new(),
            })
            .await
            .unwrap();

        let calls = framework.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                ("a.js".to_string(), vec!["t1".to_string(), "t3".to_string()]),
                ("b.js".to_string(), vec!["t2".to_string()]),
            ]
        );
    }

    #[tokio::test]
    async fn test_faulted_sessions_do_not_stall_the_run() {
        let framework = scripted(vec![
            ("bad.js", Script::Fail("SyntaxError: Unexpected token")),
            ("boom.js", Script::Panic),
            ("good.js", Script::Tests(vec![("ok", TestOutcome::Passed)])),
        ]);
        let (manager, mut controller) = execution(Some(framework.clone()));
        manager
            .start_test_run_with_sources(sources(&["bad.js", "boom.js", "good.js"]))
            .await
            .unwrap();

        let messages = drain(&mut controller);
        let errors: Vec<TestMessagePayload> = of_type(&messages, MessageType::TestMessage)
            .into_iter()
            .map(|m| m.payload_as().unwrap())
            .filter(|p: &TestMessagePayload| p.message_level == MessageLevel::Error)
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("SyntaxError"));
        assert!(errors[1].message.contains("adapter blew up"));

        assert_eq!(framework.calls.lock().unwrap().len(), 3);
        assert_eq!(of_type(&messages, MessageType::ExecutionComplete).len(), 1);
    }

    #[tokio::test]
    async fn test_empty_run_completes_immediately() {
        let (manager, mut controller) = execution(Some(scripted(vec![])));
        manager.start_test_run_with_sources(sources(&[])).await.unwrap();

        let messages = drain(&mut controller);
        assert_eq!(messages.len(), 1);
        let payload: TestExecutionCompletePayload = messages[0].payload_as().unwrap();
        assert_eq!(payload.test_run_complete_args.test_run_statistics.executed_tests, 0);
    }

    #[tokio::test]
    async fn test_missing_framework_aborts_run() {
        let (manager, mut controller) = execution(None);
        manager.start_test_run_with_sources(sources(&["a.js"])).await.unwrap();

        let messages = drain(&mut controller);
        assert_eq!(messages[0].message_type, MessageType::TestMessage);
        let payload: TestExecutionCompletePayload = messages[1].payload_as().unwrap();
        assert!(payload.test_run_complete_args.is_aborted);
        assert!(payload.test_run_complete_args.error.is_some());
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    #[tokio::test]
    async fn test_discovery_reports_found_tests_and_total() {
        let framework = scripted(vec![
            ("a.js", Script::Tests(vec![("a1", TestOutcome::None), ("a2", TestOutcome::None)])),
            ("b.js", Script::Fail("cannot load")),
            ("c.js", Script::Tests(vec![("c1", TestOutcome::None)])),
        ]);
        let (manager, mut controller) = discovery(Some(framework));
        manager
            .discover_tests(DiscoveryCriteria {
                sources: vec!["a.js".into(), "b.js".into(), "c.js".into()],
                run_settings: String::new(),
            })
            .await
            .unwrap();

        let messages = drain(&mut controller);
        assert_eq!(of_type(&messages, MessageType::TestCasesFound).len(), 3);
        let found: Vec<TestCase> = of_type(&messages, MessageType::TestCasesFound)[0]
            .payload_as()
            .unwrap();
        assert_eq!(found[0].fully_qualified_name, "a1");

        let done = of_type(&messages, MessageType::DiscoveryComplete);
        assert_eq!(done.len(), 1);
        let args: DiscoveryCompleteEventArgs = done[0].payload_as().unwrap();
        assert_eq!(args.total_tests, 3);
        assert!(!args.is_aborted);
    }

    #[tokio::test]
    async fn test_discovery_without_framework_is_aborted() {
        let (manager, mut controller) = discovery(None);
        manager
            .discover_tests(DiscoveryCriteria {
                sources: vec!["a.js".into()],
                run_settings: String::new(),
            })
            .await
            .unwrap();

        let messages = drain(&mut controller);
        let args: DiscoveryCompleteEventArgs = messages.last().unwrap().payload_as().unwrap();
        assert!(args.is_aborted);
        assert_eq!(args.total_tests, 0);
    }
}
