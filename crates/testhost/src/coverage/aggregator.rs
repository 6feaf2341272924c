//! Cumulative coverage across the sessions of a run

use super::engine::{CoverageEngine, ReportOptions};
use super::map::CoverageMap;
use crate::result::{TestHostError, TestHostResult};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Merges session snapshots and writes the end-of-run report
pub struct CoverageAggregator {
    map: CoverageMap,
    engine: Arc<dyn CoverageEngine>,
    options: ReportOptions,
    reported: bool,
}

impl std::fmt::Debug for CoverageAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageAggregator")
            .field("files", &self.map.len())
            .field("options", &self.options)
            .field("reported", &self.reported)
            .finish_non_exhaustive()
    }
}

impl CoverageAggregator {
    /// Aggregator reporting through `engine` with fixed minimal options
    #[must_use]
    pub fn new(engine: Arc<dyn CoverageEngine>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            map: CoverageMap::new(),
            engine,
            options: ReportOptions::minimal(output_dir),
            reported: false,
        }
    }

    /// Merge a session snapshot
    pub fn add_coverage(&mut self, snapshot: &CoverageMap) {
        self.map.merge(snapshot);
    }

    /// Cumulative map so far
    #[must_use]
    pub const fn map(&self) -> &CoverageMap {
        &self.map
    }

    /// Report options in use
    #[must_use]
    pub const fn options(&self) -> &ReportOptions {
        &self.options
    }

    /// Write the cumulative report. Allowed once.
    pub fn report(&mut self) -> TestHostResult<Vec<PathBuf>> {
        if self.reported {
            return Err(TestHostError::invalid_state("coverage report already written"));
        }
        self.reported = true;
        let written = self.engine.write_report(&self.map, &self.options)?;
        info!(
            files = self.map.len(),
            dir = %self.options.output_dir.display(),
            "coverage report written"
        );
        Ok(written)
    }
}
