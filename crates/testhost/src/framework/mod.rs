//! Test framework adapters
//!
//! An adapter discovers or runs the tests of one source and reports what
//! happens through a [`FrameworkListener`]. Managers never look inside a
//! framework; they only see [`FrameworkEvent`]s.

mod external;

pub use external::{ExternalRunner, ExternalRunnerFactory, COVERAGE_DIR_ENV};

use crate::protocol::{MessageLevel, TestCase, TestResult};
use crate::result::TestHostResult;
use crate::settings::TestFrameworkKind;
use async_trait::async_trait;
use std::sync::Arc;

/// Something a framework observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameworkEvent {
    /// A test was discovered
    TestCaseFound(TestCase),
    /// A test started
    TestCaseStart(TestCase),
    /// A test finished
    TestCaseEnd(TestResult),
    /// Framework output worth forwarding
    Log {
        /// Severity
        level: MessageLevel,
        /// Text
        message: String,
    },
}

/// Receives framework events as they happen
pub trait FrameworkListener: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: FrameworkEvent);
}

/// A test framework adapter
#[async_trait]
pub trait TestFramework: Send + Sync {
    /// Which framework this adapts
    fn kind(&self) -> TestFrameworkKind;

    /// Report every test in `source`
    async fn discover(&self, source: &str, listener: &dyn FrameworkListener) -> TestHostResult<()>;

    /// Run `tests` from `source`, or all of them when `tests` is empty
    async fn run(
        &self,
        source: &str,
        tests: &[TestCase],
        listener: &dyn FrameworkListener,
    ) -> TestHostResult<()>;
}

/// Resolves a framework id to an adapter
pub trait FrameworkFactory: Send + Sync {
    /// Adapter for `kind`; `coverage` asks for instrumented runs
    fn create(&self, kind: TestFrameworkKind, coverage: bool) -> TestHostResult<Arc<dyn TestFramework>>;
}
