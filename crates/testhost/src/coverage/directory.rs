//! Coverage engine backed by a dump directory
//!
//! Instrumented test runners write istanbul JSON (one file per process) into
//! the dump directory. Installing clears it, a snapshot merges whatever is
//! there, and finalizing clears it again for the next session.

use super::engine::{CoverageCapabilities, CoverageEngine, ReportFormat, ReportOptions};
use super::lcov::LcovFormatter;
use super::map::CoverageMap;
use crate::result::TestHostResult;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Coverage engine reading runner dumps from a directory
#[derive(Debug, Clone)]
pub struct DirectoryCoverageEngine {
    dump_dir: PathBuf,
}

impl DirectoryCoverageEngine {
    /// Engine over a dump directory
    #[must_use]
    pub fn new(dump_dir: impl Into<PathBuf>) -> Self {
        Self {
            dump_dir: dump_dir.into(),
        }
    }

    /// Directory the runner writes into
    #[must_use]
    pub fn dump_dir(&self) -> &Path {
        &self.dump_dir
    }
}

#[async_trait]
impl CoverageEngine for DirectoryCoverageEngine {
    async fn acquire(&self) -> TestHostResult<Arc<dyn CoverageCapabilities>> {
        tokio::fs::create_dir_all(&self.dump_dir).await?;
        debug!(dir = %self.dump_dir.display(), "coverage dump directory ready");
        Ok(Arc::new(DumpDirectory {
            dir: self.dump_dir.clone(),
        }))
    }

    fn write_report(&self, map: &CoverageMap, options: &ReportOptions) -> TestHostResult<Vec<PathBuf>> {
        fs::create_dir_all(&options.output_dir)?;
        let mut written = Vec::with_capacity(options.formats.len());
        for format in &options.formats {
            let path = options.output_dir.join(format.file_name());
            match format {
                ReportFormat::Json => fs::write(&path, map.to_json()?)?,
                ReportFormat::Lcov => LcovFormatter::new(map).save(&path)?,
            }
            written.push(path);
        }
        if options.verbose {
            let summary = map.summary();
            info!(
                files = map.len(),
                statements = %format!("{:.2}%", summary.statements.percent()),
                branches = %format!("{:.2}%", summary.branches.percent()),
                functions = %format!("{:.2}%", summary.functions.percent()),
                lines = %format!("{:.2}%", summary.lines.percent()),
                "coverage summary"
            );
        }
        Ok(written)
    }
}

struct DumpDirectory {
    dir: PathBuf,
}

impl DumpDirectory {
    fn dumps(&self) -> TestHostResult<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut dumps: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        dumps.sort();
        Ok(dumps)
    }

    fn clear(&self) -> TestHostResult<()> {
        for dump in self.dumps()? {
            fs::remove_file(&dump)?;
        }
        Ok(())
    }
}

impl CoverageCapabilities for DumpDirectory {
    fn install(&self) -> TestHostResult<()> {
        fs::create_dir_all(&self.dir)?;
        self.clear()
    }

    fn finalize(&self) -> TestHostResult<()> {
        self.clear()
    }

    fn snapshot(&self) -> TestHostResult<CoverageMap> {
        let mut map = CoverageMap::new();
        for dump in self.dumps()? {
            match fs::read_to_string(&dump)
                .map_err(Into::into)
                .and_then(|json| CoverageMap::from_json(&json))
            {
                Ok(part) => map.merge(&part),
                Err(e) => warn!(file = %dump.display(), error = %e, "skipping unreadable coverage dump"),
            }
        }
        Ok(map)
    }
}
