//! Control-protocol envelopes and payloads.
//!
//! JSON field names follow the test platform's PascalCase object model so the
//! host can talk to an unmodified controller.

use crate::result::TestHostResult;
use crate::timespan::serde_timespan;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Protocol version the host answers a version check with
pub const PROTOCOL_VERSION: u32 = 2;

/// Control message type, serialized with the platform's wire names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Version handshake
    #[serde(rename = "ProtocolVersion")]
    VersionCheck,
    /// Run every test in a list of sources
    #[serde(rename = "TestExecution.StartWithSources")]
    StartTestExecutionWithSources,
    /// Run an explicit list of tests
    #[serde(rename = "TestExecution.StartWithTests")]
    StartTestExecutionWithTests,
    /// Discover tests in a list of sources
    #[serde(rename = "TestDiscovery.Start")]
    StartDiscovery,
    /// End the session and exit
    #[serde(rename = "TestSession.Terminate")]
    SessionEnd,
    /// New test results are available
    #[serde(rename = "TestExecution.StatsChange")]
    TestRunStatsChange,
    /// Execution request finished
    #[serde(rename = "TestExecution.Completed")]
    ExecutionComplete,
    /// Tests were discovered
    #[serde(rename = "TestDiscovery.TestFound")]
    TestCasesFound,
    /// Discovery request finished
    #[serde(rename = "TestDiscovery.Completed")]
    DiscoveryComplete,
    /// Free-form diagnostic message
    #[serde(rename = "TestSession.Message")]
    TestMessage,
    /// A test started (data-collection endpoint)
    #[serde(rename = "DataCollection.TestStart")]
    DataCollectionTestStart,
    /// A test ended (data-collection endpoint)
    #[serde(rename = "DataCollection.TestEnd")]
    DataCollectionTestEnd,
    /// Anything the host does not understand
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// True for the version handshake, which does not activate a session
    #[must_use]
    pub const fn is_handshake(self) -> bool {
        matches!(self, Self::VersionCheck)
    }
}

/// Control message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    /// Selects the payload shape
    pub message_type: MessageType,
    /// Raw payload, decoded on demand
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Protocol version stamped by versioned senders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl Message {
    /// Create a message with a serializable payload
    pub fn new(message_type: MessageType, payload: &impl Serialize) -> TestHostResult<Self> {
        Ok(Self {
            message_type,
            payload: serde_json::to_value(payload)?,
            version: None,
        })
    }

    /// Create a message without payload
    #[must_use]
    pub const fn empty(message_type: MessageType) -> Self {
        Self {
            message_type,
            payload: serde_json::Value::Null,
            version: None,
        }
    }

    /// Decode the payload
    pub fn payload_as<T: DeserializeOwned>(&self) -> TestHostResult<T> {
        Ok(T::deserialize(&self.payload)?)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> TestHostResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> TestHostResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A single test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestCase {
    /// Stable identifier
    pub id: Uuid,
    /// Fully qualified name, unique within a source
    pub fully_qualified_name: String,
    /// Name shown to the user
    pub display_name: String,
    /// Source file the test lives in
    pub source: String,
    /// File declaring the test
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_file_path: Option<String>,
    /// Declaration line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
}

impl TestCase {
    /// Create a test case with an identifier derived from source and name
    #[must_use]
    pub fn new(source: impl Into<String>, fully_qualified_name: impl Into<String>) -> Self {
        let source = source.into();
        let fully_qualified_name = fully_qualified_name.into();
        Self {
            id: Self::stable_id(&source, &fully_qualified_name),
            display_name: fully_qualified_name.clone(),
            fully_qualified_name,
            source,
            code_file_path: None,
            line_number: None,
        }
    }

    /// Identifier of a test, identical across discovery and execution
    #[must_use]
    pub fn stable_id(source: &str, fully_qualified_name: &str) -> Uuid {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update([0]);
        hasher.update(fully_qualified_name.as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0_u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Uuid::from_bytes(bytes)
    }

    /// Set display name
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set declaration location
    #[must_use]
    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.code_file_path = Some(file.into());
        self.line_number = Some(line);
        self
    }
}

/// Test outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum TestOutcome {
    /// No outcome
    #[default]
    None,
    /// Passed
    Passed,
    /// Failed
    Failed,
    /// Skipped
    Skipped,
    /// Requested test does not exist
    NotFound,
}

/// Result of running a test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestResult {
    /// The test
    pub test_case: TestCase,
    /// Outcome
    pub outcome: TestOutcome,
    /// Failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Failure stack trace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack_trace: Option<String>,
    /// Time spent in the test
    #[serde(with = "serde_timespan")]
    pub duration: Duration,
    /// Start timestamp
    pub start_time: DateTime<Utc>,
    /// End timestamp
    pub end_time: DateTime<Utc>,
}

impl TestResult {
    /// Create a result ending now
    #[must_use]
    pub fn new(test_case: TestCase, outcome: TestOutcome) -> Self {
        let now = Utc::now();
        Self {
            test_case,
            outcome,
            error_message: None,
            error_stack_trace: None,
            duration: Duration::ZERO,
            start_time: now,
            end_time: now,
        }
    }

    /// Set duration, moving the start timestamp back accordingly
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        if let Ok(delta) = chrono::Duration::from_std(duration) {
            self.start_time = self.end_time - delta;
        }
        self
    }

    /// Set failure details
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>, stack: Option<String>) -> Self {
        self.error_message = Some(message.into());
        self.error_stack_trace = stack;
        self
    }
}

/// Running counts per outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunStatistics {
    /// Tests executed so far
    pub executed_tests: u64,
    /// Count per outcome
    pub stats: BTreeMap<TestOutcome, u64>,
}

impl TestRunStatistics {
    /// Count one result
    pub fn record(&mut self, outcome: TestOutcome) {
        self.executed_tests += 1;
        *self.stats.entry(outcome).or_insert(0) += 1;
    }

    /// Count for an outcome
    #[must_use]
    pub fn count(&self, outcome: TestOutcome) -> u64 {
        self.stats.get(&outcome).copied().unwrap_or(0)
    }
}

/// Payload of `TestExecution.StartWithSources`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunCriteriaWithSources {
    /// Sources to run
    pub sources: Vec<String>,
    /// Run settings XML
    #[serde(default)]
    pub run_settings: String,
}

/// Payload of `TestExecution.StartWithTests`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunCriteriaWithTests {
    /// Tests to run
    pub tests: Vec<TestCase>,
    /// Run settings XML
    #[serde(default)]
    pub run_settings: String,
}

/// Payload of `TestDiscovery.Start`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryCriteria {
    /// Sources to discover
    pub sources: Vec<String>,
    /// Run settings XML
    #[serde(default)]
    pub run_settings: String,
}

/// Payload of `TestExecution.StatsChange`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunChangedEventArgs {
    /// Results since the previous notification
    pub new_test_results: Vec<TestResult>,
    /// Cumulative statistics
    pub test_run_statistics: TestRunStatistics,
    /// Tests still running
    #[serde(default)]
    pub active_tests: Vec<TestCase>,
}

/// Completion arguments of an execution request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestRunCompleteEventArgs {
    /// Final statistics
    pub test_run_statistics: TestRunStatistics,
    /// Run was canceled
    pub is_canceled: bool,
    /// Run was aborted
    pub is_aborted: bool,
    /// Run-level error
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock time spent running tests
    #[serde(with = "serde_timespan")]
    pub elapsed_time_in_running_tests: Duration,
}

/// Payload of `TestExecution.Completed`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestExecutionCompletePayload {
    /// Completion arguments
    pub test_run_complete_args: TestRunCompleteEventArgs,
    /// Results not yet reported through a stats change
    #[serde(default)]
    pub last_run_tests: Option<TestRunChangedEventArgs>,
}

/// Payload of `TestDiscovery.Completed`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryCompleteEventArgs {
    /// Tests found across all sources
    pub total_tests: u64,
    /// Tests not yet reported through a test-found message
    #[serde(default)]
    pub last_discovered_tests: Vec<TestCase>,
    /// Discovery was aborted
    pub is_aborted: bool,
}

/// Severity of a `TestSession.Message`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageLevel {
    /// Informational
    Informational,
    /// Warning
    Warning,
    /// Error
    Error,
}

/// Payload of `TestSession.Message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestMessagePayload {
    /// Severity
    pub message_level: MessageLevel,
    /// Text
    pub message: String,
}

/// Payload of `DataCollection.TestStart`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestCaseStartArgs {
    /// The test
    pub test_case: TestCase,
}

/// Payload of `DataCollection.TestEnd`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestCaseEndArgs {
    /// The test
    pub test_case: TestCase,
    /// Outcome
    pub test_outcome: TestOutcome,
}
