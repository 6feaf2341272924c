//! Typed replies to the controller and the data-collection endpoint

use crate::channel::Outbound;
use crate::protocol::{
    DiscoveryCompleteEventArgs, Message, MessageLevel, MessageType, TestCase, TestCaseEndArgs,
    TestCaseStartArgs, TestExecutionCompletePayload, TestMessagePayload, TestResult,
    TestRunChangedEventArgs, PROTOCOL_VERSION,
};
use crate::result::TestHostResult;
use serde::Serialize;
use tracing::trace;

/// Sends protocol messages on behalf of the host
#[derive(Debug, Clone)]
pub struct MessageSender {
    primary: Outbound,
    data_collection: Option<Outbound>,
}

impl MessageSender {
    /// Create a sender for the controller channel and an optional data-collection channel
    #[must_use]
    pub const fn new(primary: Outbound, data_collection: Option<Outbound>) -> Self {
        Self {
            primary,
            data_collection,
        }
    }

    /// Whether test start/end notifications have somewhere to go
    #[must_use]
    pub const fn has_data_collection(&self) -> bool {
        self.data_collection.is_some()
    }

    /// Answer a version check
    pub fn send_version_check(&self) -> TestHostResult<()> {
        self.send(MessageType::VersionCheck, &PROTOCOL_VERSION)
    }

    /// Report new results with cumulative statistics
    pub fn send_test_run_stats_change(&self, args: &TestRunChangedEventArgs) -> TestHostResult<()> {
        self.send(MessageType::TestRunStatsChange, args)
    }

    /// Report the end of an execution request
    pub fn send_execution_complete(&self, payload: &TestExecutionCompletePayload) -> TestHostResult<()> {
        self.send(MessageType::ExecutionComplete, payload)
    }

    /// Report discovered tests
    pub fn send_test_cases_found(&self, tests: &[TestCase]) -> TestHostResult<()> {
        self.send(MessageType::TestCasesFound, &tests)
    }

    /// Report the end of a discovery request
    pub fn send_discovery_complete(&self, args: &DiscoveryCompleteEventArgs) -> TestHostResult<()> {
        self.send(MessageType::DiscoveryComplete, args)
    }

    /// Send a diagnostic message
    pub fn send_message(&self, level: MessageLevel, message: impl Into<String>) -> TestHostResult<()> {
        self.send(
            MessageType::TestMessage,
            &TestMessagePayload {
                message_level: level,
                message: message.into(),
            },
        )
    }

    /// Notify the data collector that a test started
    pub fn send_test_case_start(&self, test_case: &TestCase) -> TestHostResult<()> {
        let Some(dc) = &self.data_collection else {
            return Ok(());
        };
        dc.send(Message::new(
            MessageType::DataCollectionTestStart,
            &TestCaseStartArgs {
                test_case: test_case.clone(),
            },
        )?)
    }

    /// Notify the data collector that a test ended
    pub fn send_test_case_end(&self, result: &TestResult) -> TestHostResult<()> {
        let Some(dc) = &self.data_collection else {
            return Ok(());
        };
        dc.send(Message::new(
            MessageType::DataCollectionTestEnd,
            &TestCaseEndArgs {
                test_case: result.test_case.clone(),
                test_outcome: result.outcome,
            },
        )?)
    }

    fn send(&self, message_type: MessageType, payload: &impl Serialize) -> TestHostResult<()> {
        trace!(?message_type, "sending");
        self.primary.send(Message::new(message_type, payload)?)
    }
}
