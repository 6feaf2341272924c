//! Session orchestration
//!
//! Sessions run strictly one at a time in the order they were added. A
//! session's job is handed to the isolation boundary when it starts, and the
//! next pending session starts only once the running one is marked complete.
//! With coverage enabled each session runs under its own
//! [`CoverageAdapter`]; its snapshot is merged before the next session starts,
//! and the cumulative report is written once every session has completed.
//!
//! ```text
//!   add_session ──► [pending …] ──cursor──► active ──set_session_complete──►
//!                                              │           │
//!                                      supervise(job)   stop coverage, merge,
//!                                                        start next pending,
//!                                                        all done? report + signal
//! ```
//!
//! Bookkeeping happens under a lock; starting a job happens after the lock is
//! released, since an isolation failure calls the error callback inline and
//! error callbacks usually mark their session complete.

use crate::coverage::{CoverageAdapter, CoverageAggregator, CoverageEngine};
use crate::isolation::{supervise, ErrorCallback, Job};
use crate::protocol::TestRunStatistics;
use crate::result::{TestHostError, TestHostResult};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Where a session stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Job started, results may still arrive
    Running,
    /// Job finished
    Completed,
    /// Job faulted
    Faulted,
}

/// Last-known outcome of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResult {
    /// Source the session belongs to
    pub source: String,
    /// Status
    pub status: SessionStatus,
    /// Execution statistics so far
    pub statistics: TestRunStatistics,
    /// Tests discovered so far
    pub discovered_tests: u64,
    /// Fault description
    pub error: Option<String>,
}

impl SessionResult {
    /// In-progress result
    #[must_use]
    pub fn running(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            status: SessionStatus::Running,
            statistics: TestRunStatistics::default(),
            discovered_tests: 0,
            error: None,
        }
    }

    /// Successful completion
    #[must_use]
    pub fn completed(source: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Completed,
            ..Self::running(source)
        }
    }

    /// Faulted completion
    #[must_use]
    pub fn faulted(source: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Faulted,
            error: Some(error.into()),
            ..Self::running(source)
        }
    }

    /// Attach statistics
    #[must_use]
    pub fn with_statistics(mut self, statistics: TestRunStatistics) -> Self {
        self.statistics = statistics;
        self
    }

    /// Attach a discovered-test count
    #[must_use]
    pub const fn with_discovered_tests(mut self, count: u64) -> Self {
        self.discovered_tests = count;
        self
    }
}

/// Coverage wiring for a run
pub struct CoverageContext {
    engine: Arc<dyn CoverageEngine>,
    output_dir: PathBuf,
}

impl CoverageContext {
    /// Capture through `engine`, reporting into `output_dir`
    #[must_use]
    pub fn new(engine: Arc<dyn CoverageEngine>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            output_dir: output_dir.into(),
        }
    }
}

impl std::fmt::Debug for CoverageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageContext")
            .field("output_dir", &self.output_dir)
            .finish_non_exhaustive()
    }
}

/// What the all-complete signal carries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionSummary {
    /// Sessions completed
    pub sessions: usize,
    /// Coverage report files written
    pub coverage_files: Vec<PathBuf>,
}

/// One-shot all-complete signal
#[derive(Debug)]
pub struct AllComplete {
    rx: oneshot::Receiver<CompletionSummary>,
}

impl AllComplete {
    /// Wait until every added session has completed
    pub async fn wait(self) -> TestHostResult<CompletionSummary> {
        self.rx
            .await
            .map_err(|_| TestHostError::invalid_state("orchestrator dropped before all sessions completed"))
    }
}

/// A session waiting to be scheduled
pub struct PendingSession {
    source: String,
    job: Job,
    on_error: ErrorCallback,
}

impl PendingSession {
    /// Bundle a source with its job and error callback
    #[must_use]
    pub fn new(source: impl Into<String>, job: Job, on_error: ErrorCallback) -> Self {
        Self {
            source: source.into(),
            job,
            on_error,
        }
    }

    /// Source identifier
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl std::fmt::Debug for PendingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSession")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

struct Session {
    source: String,
    job: Option<Job>,
    on_error: Option<ErrorCallback>,
    result: Option<SessionResult>,
    complete: bool,
    coverage: Option<CoverageAdapter>,
}

struct StartPlan {
    source: String,
    job: Job,
    on_error: ErrorCallback,
}

struct Finish {
    tx: oneshot::Sender<CompletionSummary>,
    aggregator: Option<CoverageAggregator>,
    sessions: usize,
}

impl Finish {
    /// Raise the all-complete signal, writing the coverage report first.
    ///
    /// Report writing is blocking file I/O, so it moves to the blocking pool
    /// when a runtime is available.
    fn fire(self) {
        if self.aggregator.is_none() {
            return self.deliver();
        }
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || self.deliver());
            }
            Err(_) => self.deliver(),
        }
    }

    fn deliver(self) {
        let coverage_files = match self.aggregator {
            Some(mut aggregator) => aggregator.report().unwrap_or_else(|e| {
                warn!(error = %e, "coverage report failed");
                Vec::new()
            }),
            None => Vec::new(),
        };
        info!(sessions = self.sessions, "all sessions complete");
        // The waiter may have given up; nothing to do then
        let _ = self.tx.send(CompletionSummary {
            sessions: self.sessions,
            coverage_files,
        });
    }
}

struct State {
    sessions: Vec<Session>,
    index: HashMap<String, usize>,
    cursor: usize,
    active: Option<usize>,
    session_count: usize,
    complete_count: usize,
    engine: Option<Arc<dyn CoverageEngine>>,
    aggregator: Option<CoverageAggregator>,
    done: Option<oneshot::Sender<CompletionSummary>>,
}

impl State {
    fn lookup(&self, source: &str) -> TestHostResult<usize> {
        self.index
            .get(source)
            .copied()
            .ok_or_else(|| TestHostError::UnknownSession {
                source_id: source.to_string(),
            })
    }

    fn next_start(&mut self) -> Option<StartPlan> {
        if self.active.is_some() {
            return None;
        }
        while let Some(session) = self.sessions.get_mut(self.cursor) {
            let idx = self.cursor;
            self.cursor += 1;
            if session.complete {
                continue;
            }
            let (Some(job), Some(on_error)) = (session.job.take(), session.on_error.take()) else {
                continue;
            };
            let job = match &self.engine {
                Some(engine) => {
                    let adapter = CoverageAdapter::new(session.source.clone(), engine.clone());
                    let wrapped = adapter.start_coverage(job);
                    session.coverage = Some(adapter);
                    wrapped
                }
                None => job,
            };
            self.active = Some(idx);
            return Some(StartPlan {
                source: session.source.clone(),
                job,
                on_error,
            });
        }
        None
    }

    fn take_finish(&mut self) -> Option<Finish> {
        if self.complete_count != self.session_count {
            return None;
        }
        let tx = self.done.take()?;
        Some(Finish {
            tx,
            aggregator: self.aggregator.take(),
            sessions: self.complete_count,
        })
    }
}

/// Schedules sessions one at a time and signals when all are done
#[derive(Clone)]
pub struct SessionOrchestrator {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SessionOrchestrator")
            .field("session_count", &state.session_count)
            .field("complete_count", &state.complete_count)
            .field("cursor", &state.cursor)
            .field("coverage", &state.engine.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionOrchestrator {
    /// Create an orchestrator and its all-complete signal.
    ///
    /// Pass a [`CoverageContext`] to run every session under coverage.
    #[must_use]
    pub fn new(coverage: Option<CoverageContext>) -> (Self, AllComplete) {
        let (tx, rx) = oneshot::channel();
        let (engine, aggregator) = match coverage {
            Some(ctx) => (
                Some(ctx.engine.clone()),
                Some(CoverageAggregator::new(ctx.engine, ctx.output_dir)),
            ),
            None => (None, None),
        };
        let state = State {
            sessions: Vec::new(),
            index: HashMap::new(),
            cursor: 0,
            active: None,
            session_count: 0,
            complete_count: 0,
            engine,
            aggregator,
            done: Some(tx),
        };
        (
            Self {
                state: Arc::new(Mutex::new(state)),
            },
            AllComplete { rx },
        )
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule a session.
    ///
    /// Starts it right away when no other session is running.
    pub fn add_session(&self, source: impl Into<String>, job: Job, on_error: ErrorCallback) -> TestHostResult<()> {
        self.add_sessions(vec![PendingSession::new(source, job, on_error)])
    }

    /// Schedule several sessions at once.
    ///
    /// All of them are counted before the first one can start, so a fast
    /// first session cannot raise the all-complete signal while the rest are
    /// still being added. A duplicate source rejects the whole batch.
    pub fn add_sessions(&self, batch: Vec<PendingSession>) -> TestHostResult<()> {
        let plan = {
            let mut state = self.lock();
            let mut seen = HashSet::new();
            for pending in &batch {
                if state.index.contains_key(&pending.source) || !seen.insert(pending.source.as_str()) {
                    return Err(TestHostError::DuplicateSession {
                        source_id: pending.source.clone(),
                    });
                }
            }
            for PendingSession {
                source,
                job,
                on_error,
            } in batch
            {
                let idx = state.sessions.len();
                state.index.insert(source.clone(), idx);
                state.session_count += 1;
                debug!(%source, pending = state.session_count - state.complete_count, "session added");
                state.sessions.push(Session {
                    source,
                    job: Some(job),
                    on_error: Some(on_error),
                    result: None,
                    complete: false,
                    coverage: None,
                });
            }
            state.next_start()
        };
        self.launch(plan);
        Ok(())
    }

    /// Mark a session complete and move the schedule forward.
    ///
    /// Completing an already complete session only stores `result`.
    pub fn set_session_complete(&self, result: SessionResult) -> TestHostResult<()> {
        let (plan, finish) = {
            let mut state = self.lock();
            let idx = state.lookup(&result.source)?;
            let was_active = state.active == Some(idx);

            let State {
                sessions,
                aggregator,
                ..
            } = &mut *state;
            let Some(session) = sessions.get_mut(idx) else {
                return Err(TestHostError::invalid_state("session index out of range"));
            };
            if session.complete {
                debug!(source = %result.source, "session already complete, updating result");
                session.result = Some(result);
                return Ok(());
            }

            if was_active {
                if let Some(snapshot) = session.coverage.take().and_then(|c| c.stop_coverage()) {
                    if let Some(aggregator) = aggregator.as_mut() {
                        aggregator.add_coverage(&snapshot);
                    }
                }
            } else {
                debug!(source = %result.source, "completing session that never started");
            }
            session.complete = true;
            session.job = None;
            session.on_error = None;
            session.result = Some(result);

            if was_active {
                state.active = None;
            }
            state.complete_count += 1;
            debug!(
                completed = state.complete_count,
                total = state.session_count,
                "session complete"
            );
            (state.next_start(), state.take_finish())
        };

        self.launch(plan);
        if let Some(finish) = finish {
            finish.fire();
        }
        Ok(())
    }

    /// Overwrite a session's stored result without touching the schedule
    pub fn update_result_args(&self, result: SessionResult) -> TestHostResult<()> {
        let mut state = self.lock();
        let idx = state.lookup(&result.source)?;
        if let Some(session) = state.sessions.get_mut(idx) {
            session.result = Some(result);
        }
        Ok(())
    }

    /// Stored result for a source
    #[must_use]
    pub fn get_result_args(&self, source: &str) -> Option<SessionResult> {
        let state = self.lock();
        let idx = state.index.get(source)?;
        state.sessions.get(*idx)?.result.clone()
    }

    /// Sessions ever added
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock().session_count
    }

    /// Sessions whose completion has been processed
    #[must_use]
    pub fn complete_count(&self) -> usize {
        self.lock().complete_count
    }

    /// Source of the running session
    #[must_use]
    pub fn active_source(&self) -> Option<String> {
        let state = self.lock();
        state
            .active
            .and_then(|idx| state.sessions.get(idx))
            .map(|s| s.source.clone())
    }

    /// Whether a session has been marked complete; `None` if unknown
    #[must_use]
    pub fn is_session_complete(&self, source: &str) -> Option<bool> {
        let state = self.lock();
        let idx = state.index.get(source)?;
        state.sessions.get(*idx).map(|s| s.complete)
    }

    /// Whether every added session has completed
    #[must_use]
    pub fn is_complete(&self) -> bool {
        let state = self.lock();
        state.complete_count == state.session_count
    }

    /// Whether sessions run under coverage
    #[must_use]
    pub fn coverage_enabled(&self) -> bool {
        self.lock().engine.is_some()
    }

    fn launch(&self, plan: Option<StartPlan>) {
        if let Some(StartPlan {
            source,
            job,
            on_error,
        }) = plan
        {
            debug!(%source, "starting session");
            // Detached: outcome flows through set_session_complete or on_error
            let _ = supervise(&source, job, on_error);
        }
    }
}
