//! LCOV Report Formatter
//!
//! Renders a [`CoverageMap`] in the tracefile format CI coverage services read.
//!
//! ## LCOV Format
//!
//! ```text
//! TN:<test name>
//! SF:<source file>
//! FN:<line>,<function name>
//! FNDA:<execution count>,<function name>
//! FNF:<functions found>
//! FNH:<functions hit>
//! BRDA:<line>,<block>,<branch>,<taken>
//! BRF:<branches found>
//! BRH:<branches hit>
//! DA:<line>,<execution count>
//! LF:<lines found>
//! LH:<lines hit>
//! end_of_record
//! ```

use super::map::{CoverageMap, FileCoverage};
use crate::result::TestHostResult;
use std::fmt::Write;
use std::path::Path;

/// LCOV format report generator
#[derive(Debug)]
pub struct LcovFormatter<'a> {
    map: &'a CoverageMap,
    test_name: Option<String>,
}

impl<'a> LcovFormatter<'a> {
    /// Create a new LCOV formatter from coverage data
    #[must_use]
    pub const fn new(map: &'a CoverageMap) -> Self {
        Self {
            map,
            test_name: None,
        }
    }

    /// Set the test name for the report
    #[must_use]
    pub fn with_test_name(mut self, name: impl Into<String>) -> Self {
        self.test_name = Some(name.into());
        self
    }

    /// Generate LCOV format report as a string
    #[must_use]
    pub fn generate(&self) -> String {
        let mut output = String::new();
        for file in self.map.files() {
            let _ = writeln!(output, "TN:{}", self.test_name.as_deref().unwrap_or(""));
            Self::write_file(&mut output, file);
        }
        output
    }

    /// Save the LCOV report to a file
    ///
    /// # Errors
    ///
    /// Returns error if file write fails
    pub fn save(&self, path: &Path) -> TestHostResult<()> {
        std::fs::write(path, self.generate())?;
        Ok(())
    }

    fn write_file(output: &mut String, file: &FileCoverage) {
        let _ = writeln!(output, "SF:{}", file.path);

        let mut functions_hit = 0;
        for (id, meta) in &file.fn_map {
            let _ = writeln!(output, "FN:{},{}", meta.decl.start.line.max(meta.line), meta.name);
            let count = file.f.get(id).copied().unwrap_or(0);
            let _ = writeln!(output, "FNDA:{count},{}", meta.name);
            if count > 0 {
                functions_hit += 1;
            }
        }
        let _ = writeln!(output, "FNF:{}", file.fn_map.len());
        let _ = writeln!(output, "FNH:{functions_hit}");

        let mut branches_found = 0;
        let mut branches_hit = 0;
        for (block, (id, arms)) in file.b.iter().enumerate() {
            let line = file.branch_map.get(id).map_or(0, |meta| meta.loc.start.line.max(meta.line));
            for (arm, taken) in arms.iter().enumerate() {
                let _ = writeln!(output, "BRDA:{line},{block},{arm},{taken}");
                branches_found += 1;
                if *taken > 0 {
                    branches_hit += 1;
                }
            }
        }
        let _ = writeln!(output, "BRF:{branches_found}");
        let _ = writeln!(output, "BRH:{branches_hit}");

        let lines = file.line_hits();
        let mut lines_hit = 0;
        for (line, count) in &lines {
            let _ = writeln!(output, "DA:{line},{count}");
            if *count > 0 {
                lines_hit += 1;
            }
        }
        let _ = writeln!(output, "LF:{}", lines.len());
        let _ = writeln!(output, "LH:{lines_hit}");

        output.push_str("end_of_record\n");
    }
}
