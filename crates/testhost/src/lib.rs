//! Probar Test Host: protocol-driven JavaScript test sessions
//!
//! A long-lived host process that discovers and runs JavaScript tests on
//! behalf of a remote test-platform controller. Requests arrive over a
//! framed message channel; each request becomes an ordered job, each source
//! inside it a session that runs alone behind a fault-isolation boundary,
//! optionally wrapped in code-coverage capture.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌───────────┐   ┌──────────────────┐
//! │ Controller   │──►│ TestHost   │──►│ JobQueue  │──►│ Execution /      │
//! │ (channel)    │   │ dispatcher │   │ (ordered) │   │ DiscoveryManager │
//! └──────────────┘   └────────────┘   └───────────┘   └────────┬─────────┘
//!        ▲                                                      │
//!        │            ┌─────────────────────┐   ┌──────────────▼─────────┐
//!        └────────────│ MessageSender       │◄──│ SessionOrchestrator    │
//!                     └─────────────────────┘   │  isolation + coverage  │
//!                                               └────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use probar_testhost::{ExternalRunnerFactory, DirectoryCoverageEngine, Settings, TestHost};
//! use std::sync::Arc;
//!
//! # async fn serve() -> probar_testhost::TestHostResult<()> {
//! let settings = Arc::new(Settings::new(12345).with_runner_script("runner.js"));
//! let frameworks = Arc::new(ExternalRunnerFactory::new(
//!     settings.runner.clone(),
//!     settings.coverage.dump_dir.clone(),
//! ));
//! let engine = Arc::new(DirectoryCoverageEngine::new(settings.coverage.dump_dir.clone()));
//! let host = TestHost::connect(settings, frameworks, Some(engine)).await?;
//! let exit = host.run().await;
//! std::process::exit(exit.exit_code());
//! # }
//! ```

#![warn(missing_docs)]

pub mod channel;
pub mod coverage;
pub mod framework;
pub mod protocol;
pub mod timespan;

mod host;
mod isolation;
mod job_queue;
mod manager;
mod result;
mod sender;
mod session;
mod settings;

pub use channel::{connect_tcp, framed_channel, memory_channel, ControllerEnd, Inbound, Outbound};
pub use coverage::{
    CoverageAdapter, CoverageAggregator, CoverageCapabilities, CoverageEngine, CoverageMap,
    CoverageSummary, DirectoryCoverageEngine, FileCoverage, LcovFormatter, ReportFormat,
    ReportOptions,
};
pub use framework::{
    ExternalRunner, ExternalRunnerFactory, FrameworkEvent, FrameworkFactory, FrameworkListener,
    TestFramework, COVERAGE_DIR_ENV,
};
pub use host::{Dispatch, HostExit, HostState, TestHost, LIVENESS_INTERVAL};
pub use isolation::{supervise, ErrorCallback, Job};
pub use job_queue::{JobQueue, JobQueueWorker, QueuedJob};
pub use manager::{DiscoveryManager, ExecutionManager};
pub use protocol::{Message, MessageLevel, MessageType, TestCase, TestOutcome, TestResult, PROTOCOL_VERSION};
pub use result::{JobError, TestHostError, TestHostResult};
pub use sender::MessageSender;
pub use session::{
    AllComplete, CompletionSummary, CoverageContext, PendingSession, SessionOrchestrator,
    SessionResult, SessionStatus,
};
pub use settings::{
    CoverageSettings, RunSettings, RunnerSettings, Settings, TestFrameworkKind,
    DEFAULT_COVERAGE_DIR, DEFAULT_COVERAGE_DUMP_DIR,
};
