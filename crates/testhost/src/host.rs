//! Message dispatcher and host lifecycle
//!
//! The host reads control messages off the primary channel and turns each
//! execution or discovery request into a queued job. Everything else the
//! controller sends is answered inline or ignored.

use crate::channel::{connect_tcp, Inbound};
use crate::coverage::CoverageEngine;
use crate::framework::FrameworkFactory;
use crate::job_queue::{JobQueue, JobQueueWorker, QueuedJob};
use crate::manager::{DiscoveryManager, ExecutionManager};
use crate::protocol::{
    DiscoveryCriteria, Message, MessageType, TestRunCriteriaWithSources, TestRunCriteriaWithTests,
};
use crate::result::TestHostResult;
use crate::sender::MessageSender;
use crate::settings::Settings;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

/// Interval of the keep-alive tick while waiting for work
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Dispatcher lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostState {
    /// No channel yet
    #[default]
    Disconnected,
    /// Channel open, only handshakes seen
    Connected,
    /// At least one request received
    Active,
    /// Session ended; terminal
    Ended,
}

/// Why [`TestHost::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostExit {
    /// Controller sent `TestSession.Terminate`
    SessionEnded,
    /// Controller went away without ending the session
    ChannelClosed,
}

impl HostExit {
    /// Process exit status
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::SessionEnded => 0,
            Self::ChannelClosed => 1,
        }
    }
}

/// What the run loop does after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Keep reading
    Continue,
    /// Stop; the session is over
    End,
}

/// A connected test host
pub struct TestHost {
    settings: Arc<Settings>,
    inbound: Inbound,
    sender: MessageSender,
    frameworks: Arc<dyn FrameworkFactory>,
    coverage_engine: Option<Arc<dyn CoverageEngine>>,
    queue: JobQueue,
    worker: Option<JobQueueWorker>,
    state: HostState,
}

impl std::fmt::Debug for TestHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHost")
            .field("endpoint", &self.settings.endpoint_addr())
            .field("state", &self.state)
            .field("jobs_submitted", &self.queue.submitted())
            .finish_non_exhaustive()
    }
}

impl TestHost {
    /// Create a host over an already-open channel
    #[must_use]
    pub fn new(
        settings: Arc<Settings>,
        inbound: Inbound,
        sender: MessageSender,
        frameworks: Arc<dyn FrameworkFactory>,
        coverage_engine: Option<Arc<dyn CoverageEngine>>,
    ) -> Self {
        let (queue, worker) = JobQueue::new();
        Self {
            settings,
            inbound,
            sender,
            frameworks,
            coverage_engine,
            queue,
            worker: Some(worker),
            state: HostState::Connected,
        }
    }

    /// Connect to the controller, plus the data collector when configured
    pub async fn connect(
        settings: Arc<Settings>,
        frameworks: Arc<dyn FrameworkFactory>,
        coverage_engine: Option<Arc<dyn CoverageEngine>>,
    ) -> TestHostResult<Self> {
        settings.validate()?;

        let data_collection = match settings.data_collection_addr() {
            Some(addr) => {
                let (_inbound, outbound) = connect_tcp(addr).await?;
                info!(%addr, "connected to data collector");
                Some(outbound)
            }
            None => None,
        };

        let addr = settings.endpoint_addr();
        let (inbound, outbound) = connect_tcp(addr).await?;
        info!(%addr, framework = %settings.test_framework, "connected to controller");

        let sender = MessageSender::new(outbound, data_collection);
        Ok(Self::new(settings, inbound, sender, frameworks, coverage_engine))
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> HostState {
        self.state
    }

    /// Requests queued so far
    #[must_use]
    pub fn jobs_submitted(&self) -> u64 {
        self.queue.submitted()
    }

    /// Dispatch one inbound message
    pub fn handle_message(&mut self, message: Message) -> Dispatch {
        if self.state == HostState::Ended {
            trace!(message_type = ?message.message_type, "session already ended");
            return Dispatch::End;
        }
        if self.state == HostState::Connected && !message.message_type.is_handshake() {
            debug!("host active");
            self.state = HostState::Active;
        }

        match message.message_type {
            MessageType::VersionCheck => {
                if let Err(e) = self.sender.send_version_check() {
                    warn!(error = %e, "failed to answer version check");
                }
            }
            MessageType::StartTestExecutionWithSources => {
                if let Some(criteria) = decode::<TestRunCriteriaWithSources>(&message) {
                    let manager = self.execution_manager();
                    self.submit("execution", Box::pin(manager.start_test_run_with_sources(criteria)));
                }
            }
            MessageType::StartTestExecutionWithTests => {
                if let Some(criteria) = decode::<TestRunCriteriaWithTests>(&message) {
                    let manager = self.execution_manager();
                    self.submit("execution", Box::pin(manager.start_test_run_with_tests(criteria)));
                }
            }
            MessageType::StartDiscovery => {
                if let Some(criteria) = decode::<DiscoveryCriteria>(&message) {
                    let manager = DiscoveryManager::new(
                        self.settings.clone(),
                        self.sender.clone(),
                        self.frameworks.clone(),
                    );
                    self.submit("discovery", Box::pin(manager.discover_tests(criteria)));
                }
            }
            MessageType::SessionEnd => {
                info!("session end requested");
                self.state = HostState::Ended;
                return Dispatch::End;
            }
            other => debug!(message_type = ?other, "ignoring message"),
        }
        Dispatch::Continue
    }

    /// Serve the controller until the session ends or the channel closes
    pub async fn run(mut self) -> HostExit {
        let worker = self
            .worker
            .take()
            .map(|worker| tokio::spawn(worker.run()));
        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);

        let exit = loop {
            tokio::select! {
                message = self.inbound.recv() => {
                    match message {
                        Some(message) => {
                            let message_type = message.message_type;
                            debug!(?message_type, "received");
                            if self.handle_message(message) == Dispatch::End {
                                break HostExit::SessionEnded;
                            }
                        }
                        None => {
                            warn!("controller closed the channel");
                            break HostExit::ChannelClosed;
                        }
                    }
                }
                _ = liveness.tick() => trace!("liveness tick"),
            }
        };

        if let Some(worker) = worker {
            worker.abort();
        }
        info!(?exit, jobs = self.queue.submitted(), "test host stopped");
        exit
    }

    fn execution_manager(&self) -> ExecutionManager {
        ExecutionManager::new(
            self.settings.clone(),
            self.sender.clone(),
            self.frameworks.clone(),
            self.coverage_engine.clone(),
        )
    }

    fn submit(&self, kind: &str, job: QueuedJob) {
        let run_id = Uuid::new_v4();
        let span = info_span!("request", %run_id, kind);
        let label = format!("{kind}:{run_id}");
        if let Err(e) = self.queue.submit(label, Box::pin(job.instrument(span))) {
            warn!(error = %e, kind, "failed to queue request");
        }
    }
}

fn decode<T: DeserializeOwned>(message: &Message) -> Option<T> {
    match message.payload_as::<T>() {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(message_type = ?message.message_type, error = %e, "ignoring malformed payload");
            None
        }
    }
}
