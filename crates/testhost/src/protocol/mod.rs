//! Control protocol spoken with the test platform controller.

pub mod codec;
mod messages;

pub use messages::{
    DiscoveryCompleteEventArgs, DiscoveryCriteria, Message, MessageLevel, MessageType,
    TestCase, TestCaseEndArgs, TestCaseStartArgs, TestExecutionCompletePayload,
    TestMessagePayload, TestOutcome, TestResult, TestRunChangedEventArgs,
    TestRunCompleteEventArgs, TestRunCriteriaWithSources, TestRunCriteriaWithTests,
    TestRunStatistics, PROTOCOL_VERSION,
};
