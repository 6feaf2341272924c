//! Boundary to the coverage instrumentation engine

use super::map::CoverageMap;
use crate::result::TestHostResult;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Instrumentation operations granted by an engine once it is ready
pub trait CoverageCapabilities: Send + Sync {
    /// Install instrumentation hooks
    fn install(&self) -> TestHostResult<()>;

    /// Remove hooks and finalize instrumentation
    fn finalize(&self) -> TestHostResult<()>;

    /// Capture the coverage collected so far
    fn snapshot(&self) -> TestHostResult<CoverageMap>;
}

/// Report formats an engine can render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportFormat {
    /// `coverage-final.json`
    Json,
    /// `lcov.info`
    Lcov,
}

impl ReportFormat {
    /// File the format is written to
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Json => "coverage-final.json",
            Self::Lcov => "lcov.info",
        }
    }
}

/// Reporting configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOptions {
    /// Output directory
    pub output_dir: PathBuf,
    /// Print a summary while reporting
    pub verbose: bool,
    /// Also report files that were never loaded
    pub include_all_sources: bool,
    /// Formats to write
    pub formats: Vec<ReportFormat>,
}

impl ReportOptions {
    /// Fixed settings for the end-of-run report: quiet, unfiltered
    #[must_use]
    pub fn minimal(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            verbose: false,
            include_all_sources: false,
            formats: vec![ReportFormat::Json, ReportFormat::Lcov],
        }
    }
}

/// External coverage engine
#[async_trait]
pub trait CoverageEngine: Send + Sync {
    /// Acquire instrumentation capabilities; may take a while
    async fn acquire(&self) -> TestHostResult<Arc<dyn CoverageCapabilities>>;

    /// Render a cumulative map, returning the files written
    fn write_report(&self, map: &CoverageMap, options: &ReportOptions) -> TestHostResult<Vec<PathBuf>>;
}
