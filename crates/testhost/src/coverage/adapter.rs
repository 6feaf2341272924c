//! Per-session coverage adapter
//!
//! Capabilities are requested from the engine as soon as the adapter is
//! built. A job handed to [`CoverageAdapter::start_coverage`] before they
//! arrive waits for them and then runs with the usual install, run,
//! snapshot sequence. If acquisition fails the job runs without coverage.

use super::engine::{CoverageCapabilities, CoverageEngine};
use super::map::CoverageMap;
use crate::isolation::Job;
use crate::result::JobError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Clone)]
enum Capabilities {
    Acquiring,
    Ready(Arc<dyn CoverageCapabilities>),
    Unavailable,
    Stopped,
}

impl Capabilities {
    const fn label(&self) -> &'static str {
        match self {
            Self::Acquiring => "acquiring",
            Self::Ready(_) => "ready",
            Self::Unavailable => "unavailable",
            Self::Stopped => "stopped",
        }
    }
}

struct Inner {
    source: String,
    state: watch::Sender<Capabilities>,
    pending: AtomicBool,
    latest: Mutex<Option<CoverageMap>>,
}

impl Inner {
    fn resolve(&self, acquired: Capabilities) {
        self.state.send_if_modified(|state| {
            if matches!(state, Capabilities::Acquiring) {
                *state = acquired;
                true
            } else {
                false
            }
        });
    }

    fn is_ready(&self) -> bool {
        matches!(*self.state.borrow(), Capabilities::Ready(_))
    }

    fn capture(&self, caps: &dyn CoverageCapabilities) {
        match caps.snapshot() {
            Ok(map) => {
                *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(map);
            }
            Err(e) => warn!(source = %self.source, error = %e, "coverage snapshot failed"),
        }
    }
}

/// Coverage instrumentation around one session's job
#[derive(Clone)]
pub struct CoverageAdapter {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CoverageAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageAdapter")
            .field("source", &self.inner.source)
            .field("state", &self.inner.state.borrow().label())
            .finish_non_exhaustive()
    }
}

impl CoverageAdapter {
    /// Build an adapter and start acquiring capabilities in the background
    #[must_use]
    pub fn new(source: impl Into<String>, engine: Arc<dyn CoverageEngine>) -> Self {
        let (state, _) = watch::channel(Capabilities::Acquiring);
        let inner = Arc::new(Inner {
            source: source.into(),
            state,
            pending: AtomicBool::new(false),
            latest: Mutex::new(None),
        });

        match Handle::try_current() {
            Ok(handle) => {
                let acquiring = inner.clone();
                handle.spawn(async move {
                    let acquired = match engine.acquire().await {
                        Ok(caps) => Capabilities::Ready(caps),
                        Err(e) => {
                            warn!(source = %acquiring.source, error = %e, "coverage unavailable, running without it");
                            Capabilities::Unavailable
                        }
                    };
                    acquiring.resolve(acquired);
                });
            }
            Err(e) => {
                warn!(source = %inner.source, error = %e, "no runtime to acquire coverage, running without it");
                inner.resolve(Capabilities::Unavailable);
            }
        }

        Self { inner }
    }

    /// Whether capabilities have arrived and coverage is still running
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// Wrap `job` so it runs under instrumentation.
    ///
    /// Only one job may be handed to an adapter; a second one fails when
    /// polled.
    #[must_use]
    pub fn start_coverage(&self, job: Job) -> Job {
        let inner = self.inner.clone();
        if inner.pending.swap(true, Ordering::SeqCst) {
            return Box::pin(async {
                Err(JobError::failed("coverage adapter already has a job"))
            });
        }

        Box::pin(async move {
            let mut rx = inner.state.subscribe();
            let state = match rx
                .wait_for(|s| !matches!(s, Capabilities::Acquiring))
                .await
            {
                Ok(state) => state.clone(),
                Err(_) => Capabilities::Unavailable,
            };

            match state {
                Capabilities::Ready(caps) => {
                    if let Err(e) = caps.install() {
                        warn!(source = %inner.source, error = %e, "coverage hook failed, running without it");
                        return job.await;
                    }
                    let result = job.await;
                    if inner.is_ready() {
                        inner.capture(caps.as_ref());
                    }
                    result
                }
                Capabilities::Stopped => {
                    debug!(source = %inner.source, "coverage stopped before the job started, skipping it");
                    Ok(())
                }
                Capabilities::Acquiring | Capabilities::Unavailable => job.await,
            }
        })
    }

    /// Finalize instrumentation and hand back the latest snapshot.
    ///
    /// When instrumentation is live a fresh snapshot is taken first, so
    /// coverage from a job that is still unwinding is not lost.
    pub fn stop_coverage(&self) -> Option<CoverageMap> {
        let previous = self.inner.state.send_replace(Capabilities::Stopped);
        if let Capabilities::Ready(caps) = previous {
            self.inner.capture(caps.as_ref());
            if let Err(e) = caps.finalize() {
                warn!(source = %self.inner.source, error = %e, "coverage finalize failed");
            }
        }
        self.inner
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::coverage::engine::ReportOptions;
    use crate::coverage::map::{FileCoverage, Range};
    use crate::result::{TestHostError, TestHostResult};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU64;
    use tokio::sync::Notify;

    /// Counts calls and reports one statement hit per snapshot taken
    #[derive(Default)]
    struct CountingCaps {
        installs: AtomicU64,
        finalizes: AtomicU64,
        snapshots: AtomicU64,
    }

    impl CoverageCapabilities for CountingCaps {
        fn install(&self) -> TestHostResult<()> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn finalize(&self) -> TestHostResult<()> {
            self.finalizes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn snapshot(&self) -> TestHostResult<CoverageMap> {
            let n = self.snapshots.fetch_add(1, Ordering::SeqCst) + 1;
            let mut map = CoverageMap::new();
            map.add_file(FileCoverage::new("lib.js").with_statement("0", Range::lines(1, 1), n));
            Ok(map)
        }
    }

    struct GatedEngine {
        caps: Arc<CountingCaps>,
        gate: Arc<Notify>,
        fail: bool,
    }

    #[async_trait]
    impl CoverageEngine for GatedEngine {
        async fn acquire(&self) -> TestHostResult<Arc<dyn CoverageCapabilities>> {
            self.gate.notified().await;
            if self.fail {
                return Err(TestHostError::coverage("instrumenter missing"));
            }
            Ok(self.caps.clone())
        }

        fn write_report(&self, _: &CoverageMap, _: &ReportOptions) -> TestHostResult<Vec<PathBuf>> {
            Ok(Vec::new())
        }
    }

    fn engine(fail: bool) -> (Arc<GatedEngine>, Arc<CountingCaps>, Arc<Notify>) {
        let caps = Arc::new(CountingCaps::default());
        let gate = Arc::new(Notify::new());
        let engine = Arc::new(GatedEngine {
            caps: caps.clone(),
            gate: gate.clone(),
            fail,
        });
        (engine, caps, gate)
    }

    fn counting_job(ran: &Arc<AtomicU64>) -> Job {
        let ran = ran.clone();
        Box::pin(async move {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    // =========================================================================
    // Capability timing
    // =========================================================================

    #[tokio::test]
    async fn test_job_waits_for_capabilities() {
        let (engine, caps, gate) = engine(false);
        let adapter = CoverageAdapter::new("a.js", engine);
        let ran = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(adapter.start_coverage(counting_job(&ran)));
        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!adapter.is_ready());

        gate.notify_one();
        task.await.unwrap().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(caps.installs.load(Ordering::SeqCst), 1);
        assert_eq!(caps.snapshots.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ready_adapter_runs_install_job_snapshot() {
        let (engine, caps, gate) = engine(false);
        gate.notify_one();
        let adapter = CoverageAdapter::new("a.js", engine);
        let ran = Arc::new(AtomicU64::new(0));

        adapter.start_coverage(counting_job(&ran)).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(caps.installs.load(Ordering::SeqCst), 1);

        let map = adapter.stop_coverage().unwrap();
        // snapshot after the job, then a fresh one on stop
        assert_eq!(map.file("lib.js").unwrap().s["0"], 2);
        assert_eq!(caps.finalizes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_job_is_rejected() {
        let (engine, _caps, gate) = engine(false);
        gate.notify_one();
        let adapter = CoverageAdapter::new("a.js", engine);
        let ran = Arc::new(AtomicU64::new(0));

        let _first = adapter.start_coverage(counting_job(&ran));
        let second = adapter.start_coverage(counting_job(&ran)).await;
        assert!(matches!(second, Err(JobError::Failed { .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    // =========================================================================
    // Degradation
    // =========================================================================

    #[tokio::test]
    async fn test_failed_acquisition_runs_job_without_coverage() {
        let (engine, caps, gate) = engine(true);
        gate.notify_one();
        let adapter = CoverageAdapter::new("a.js", engine);
        let ran = Arc::new(AtomicU64::new(0));

        adapter.start_coverage(counting_job(&ran)).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(caps.installs.load(Ordering::SeqCst), 0);
        assert!(adapter.stop_coverage().is_none());
    }

    #[test]
    fn test_no_runtime_degrades_immediately() {
        let (engine, _caps, _gate) = engine(false);
        let adapter = CoverageAdapter::new("a.js", engine);
        assert!(!adapter.is_ready());
        assert!(adapter.stop_coverage().is_none());
    }

    #[tokio::test]
    async fn test_job_error_still_propagates_under_coverage() {
        let (engine, caps, gate) = engine(false);
        gate.notify_one();
        let adapter = CoverageAdapter::new("a.js", engine);

        let result = adapter
            .start_coverage(Box::pin(async { Err(JobError::failed("red")) }))
            .await;
        assert_eq!(result, Err(JobError::failed("red")));
        assert_eq!(caps.snapshots.load(Ordering::SeqCst), 1);
    }

    // =========================================================================
    // Stop
    // =========================================================================

    #[tokio::test]
    async fn test_stop_before_capabilities_skips_pending_job() {
        let (engine, caps, gate) = engine(false);
        let adapter = CoverageAdapter::new("a.js", engine);
        let ran = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(adapter.start_coverage(counting_job(&ran)));
        tokio::task::yield_now().await;

        assert!(adapter.stop_coverage().is_none());
        gate.notify_one();
        task.await.unwrap().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(caps.installs.load(Ordering::SeqCst), 0);
        assert_eq!(caps.finalizes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_inside_job_skips_trailing_snapshot() {
        let (engine, caps, gate) = engine(false);
        gate.notify_one();
        let adapter = CoverageAdapter::new("a.js", engine);

        let stopper = adapter.clone();
        let stopped = Arc::new(Mutex::new(None));
        let slot = stopped.clone();
        adapter
            .start_coverage(Box::pin(async move {
                *slot.lock().unwrap() = stopper.stop_coverage();
                Ok(())
            }))
            .await
            .unwrap();

        assert_eq!(caps.snapshots.load(Ordering::SeqCst), 1);
        let map = stopped.lock().unwrap().take().unwrap();
        assert_eq!(map.file("lib.js").unwrap().s["0"], 1);
    }
}
