//! Istanbul-style coverage data
//!
//! A [`CoverageMap`] is keyed by instrumented file. Each [`FileCoverage`]
//! carries the instrumentation metadata (`statementMap`, `fnMap`,
//! `branchMap`) and the hit counters (`s`, `f`, `b`) in the JSON layout the
//! JavaScript instrumenters emit.
//!
//! Merging is associative and commutative: counters add (saturating), branch
//! vectors widen to the longest arm list, and conflicting metadata resolves
//! to the greater value. All maps are ordered, so the same set of snapshots
//! serialises to the same bytes whatever order they were merged in.

use crate::result::TestHostResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Position in a source file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    /// 1-based line
    pub line: u32,
    /// 0-based column; instrumenters emit `null` when unknown
    #[serde(default)]
    pub column: Option<u32>,
}

impl Position {
    /// Position at a line and column
    #[must_use]
    pub const fn new(line: u32, column: u32) -> Self {
        Self {
            line,
            column: Some(column),
        }
    }
}

/// Source range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    /// Start position
    pub start: Position,
    /// End position
    pub end: Position,
}

impl Range {
    /// Range covering whole lines
    #[must_use]
    pub const fn lines(start: u32, end: u32) -> Self {
        Self {
            start: Position::new(start, 0),
            end: Position::new(end, 0),
        }
    }
}

/// Function metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionMeta {
    /// Function name, `(anonymous_N)` for anonymous functions
    pub name: String,
    /// Declaration range
    #[serde(default)]
    pub decl: Range,
    /// Body range
    #[serde(default)]
    pub loc: Range,
    /// Declaration line
    #[serde(default)]
    pub line: u32,
}

/// Branch metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchMeta {
    /// Whole branch construct
    #[serde(default)]
    pub loc: Range,
    /// Construct kind (`if`, `cond-expr`, `switch`, `binary-expr`, ...)
    #[serde(rename = "type", default)]
    pub kind: String,
    /// One range per arm
    #[serde(default)]
    pub locations: Vec<Range>,
    /// Line of the construct
    #[serde(default)]
    pub line: u32,
}

/// Coverage for one file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCoverage {
    /// File path as instrumented
    pub path: String,
    /// Statement ranges by id
    #[serde(default)]
    pub statement_map: BTreeMap<String, Range>,
    /// Functions by id
    #[serde(default)]
    pub fn_map: BTreeMap<String, FunctionMeta>,
    /// Branches by id
    #[serde(default)]
    pub branch_map: BTreeMap<String, BranchMeta>,
    /// Statement hits
    #[serde(default)]
    pub s: BTreeMap<String, u64>,
    /// Function hits
    #[serde(default)]
    pub f: BTreeMap<String, u64>,
    /// Hits per branch arm
    #[serde(default)]
    pub b: BTreeMap<String, Vec<u64>>,
}

impl FileCoverage {
    /// Empty coverage for a file
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Add a statement with its hit count
    #[must_use]
    pub fn with_statement(mut self, id: &str, range: Range, hits: u64) -> Self {
        self.statement_map.insert(id.to_string(), range);
        self.s.insert(id.to_string(), hits);
        self
    }

    /// Add a function with its hit count
    #[must_use]
    pub fn with_function(mut self, id: &str, meta: FunctionMeta, hits: u64) -> Self {
        self.fn_map.insert(id.to_string(), meta);
        self.f.insert(id.to_string(), hits);
        self
    }

    /// Add a branch with per-arm hit counts
    #[must_use]
    pub fn with_branch(mut self, id: &str, meta: BranchMeta, hits: Vec<u64>) -> Self {
        self.branch_map.insert(id.to_string(), meta);
        self.b.insert(id.to_string(), hits);
        self
    }

    /// Merge another snapshot of the same file into this one
    pub fn merge(&mut self, other: &Self) {
        if other.path > self.path {
            self.path.clone_from(&other.path);
        }
        merge_meta(&mut self.statement_map, &other.statement_map);
        merge_meta(&mut self.fn_map, &other.fn_map);
        merge_meta(&mut self.branch_map, &other.branch_map);
        merge_counts(&mut self.s, &other.s);
        merge_counts(&mut self.f, &other.f);
        for (id, arms) in &other.b {
            let into = self.b.entry(id.clone()).or_default();
            if into.len() < arms.len() {
                into.resize(arms.len(), 0);
            }
            for (slot, hits) in into.iter_mut().zip(arms) {
                *slot = slot.saturating_add(*hits);
            }
        }
    }

    /// Hits per line: the highest hit count of any statement starting there
    #[must_use]
    pub fn line_hits(&self) -> BTreeMap<u32, u64> {
        let mut lines = BTreeMap::new();
        for (id, range) in &self.statement_map {
            let hits = self.s.get(id).copied().unwrap_or(0);
            let entry = lines.entry(range.start.line).or_insert(0);
            if hits > *entry {
                *entry = hits;
            }
        }
        lines
    }

    /// Found/hit totals for this file
    #[must_use]
    pub fn summary(&self) -> CoverageSummary {
        let lines = self.line_hits();
        CoverageSummary {
            statements: CoverageCounts::tally(self.s.values().copied()),
            lines: CoverageCounts::tally(lines.values().copied()),
            functions: CoverageCounts::tally(self.f.values().copied()),
            branches: CoverageCounts::tally(self.b.values().flatten().copied()),
        }
    }
}

fn merge_meta<T: Ord + Clone>(into: &mut BTreeMap<String, T>, from: &BTreeMap<String, T>) {
    for (id, meta) in from {
        match into.get_mut(id) {
            Some(existing) if *meta > *existing => existing.clone_from(meta),
            Some(_) => {}
            None => {
                into.insert(id.clone(), meta.clone());
            }
        }
    }
}

fn merge_counts(into: &mut BTreeMap<String, u64>, from: &BTreeMap<String, u64>) {
    for (id, hits) in from {
        let slot = into.entry(id.clone()).or_insert(0);
        *slot = slot.saturating_add(*hits);
    }
}

/// Found/hit pair for one metric
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageCounts {
    /// Items instrumented
    pub found: u64,
    /// Items executed at least once
    pub hit: u64,
}

impl CoverageCounts {
    fn tally(hits: impl Iterator<Item = u64>) -> Self {
        hits.fold(Self::default(), |mut acc, h| {
            acc.found += 1;
            if h > 0 {
                acc.hit += 1;
            }
            acc
        })
    }

    /// Percentage hit; an empty metric counts as fully covered
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> f64 {
        if self.found == 0 {
            100.0
        } else {
            (self.hit as f64 / self.found as f64) * 100.0
        }
    }

    const fn add(self, other: Self) -> Self {
        Self {
            found: self.found + other.found,
            hit: self.hit + other.hit,
        }
    }
}

/// Coverage summary statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSummary {
    /// Statements
    pub statements: CoverageCounts,
    /// Lines
    pub lines: CoverageCounts,
    /// Functions
    pub functions: CoverageCounts,
    /// Branch arms
    pub branches: CoverageCounts,
}

impl CoverageSummary {
    const fn add(self, other: Self) -> Self {
        Self {
            statements: self.statements.add(other.statements),
            lines: self.lines.add(other.lines),
            functions: self.functions.add(other.functions),
            branches: self.branches.add(other.branches),
        }
    }
}

/// File-keyed cumulative coverage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoverageMap {
    files: BTreeMap<String, FileCoverage>,
}

impl CoverageMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse istanbul JSON (`coverage-final.json` layout)
    pub fn from_json(json: &str) -> TestHostResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialise as istanbul JSON
    pub fn to_json(&self) -> TestHostResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Add one file's coverage, merging with anything already present
    pub fn add_file(&mut self, file: FileCoverage) {
        match self.files.get_mut(&file.path) {
            Some(existing) => existing.merge(&file),
            None => {
                self.files.insert(file.path.clone(), file);
            }
        }
    }

    /// Merge another map into this one
    pub fn merge(&mut self, other: &Self) {
        for (key, file) in &other.files {
            match self.files.get_mut(key) {
                Some(existing) => existing.merge(file),
                None => {
                    self.files.insert(key.clone(), file.clone());
                }
            }
        }
    }

    /// Coverage for a file
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&FileCoverage> {
        self.files.get(path)
    }

    /// Files in path order
    pub fn files(&self) -> impl Iterator<Item = &FileCoverage> {
        self.files.values()
    }

    /// Number of files
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether no file has coverage
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Totals across every file
    #[must_use]
    pub fn summary(&self) -> CoverageSummary {
        self.files
            .values()
            .fold(CoverageSummary::default(), |acc, f| acc.add(f.summary()))
    }
}
