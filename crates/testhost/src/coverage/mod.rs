//! Code coverage capture and aggregation
//!
//! - [`CoverageAdapter`]: instruments one session's job
//! - [`CoverageAggregator`]: merges session snapshots and writes the run report
//! - [`CoverageEngine`]: boundary to the instrumentation engine, with
//!   [`DirectoryCoverageEngine`] reading istanbul dumps from disk

mod adapter;
mod aggregator;
mod directory;
mod engine;
mod lcov;
mod map;

pub use adapter::CoverageAdapter;
pub use aggregator::CoverageAggregator;
pub use directory::DirectoryCoverageEngine;
pub use engine::{CoverageCapabilities, CoverageEngine, ReportFormat, ReportOptions};
pub use lcov::LcovFormatter;
pub use map::{
    BranchMeta, CoverageCounts, CoverageMap, CoverageSummary, FileCoverage, FunctionMeta,
    Position, Range,
};
