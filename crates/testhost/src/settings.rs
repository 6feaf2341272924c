//! Host configuration
//!
//! [`Settings`] is resolved once at startup and shared read-only with the
//! dispatcher and every run. [`RunSettings`] is the per-run slice probed from
//! the run-settings XML the controller sends with each request.

use crate::result::{TestHostError, TestHostResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

/// Default coverage report directory
pub const DEFAULT_COVERAGE_DIR: &str = "./coverage";
/// Default directory the test runner dumps raw coverage into
pub const DEFAULT_COVERAGE_DUMP_DIR: &str = "./.testhost/coverage";

/// JavaScript test framework the host drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestFrameworkKind {
    /// Jasmine
    Jasmine,
    /// Mocha
    #[default]
    Mocha,
    /// Jest
    Jest,
}

impl TestFrameworkKind {
    /// Identifier passed to the runner script
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Jasmine => "jasmine",
            Self::Mocha => "mocha",
            Self::Jest => "jest",
        }
    }
}

impl fmt::Display for TestFrameworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestFrameworkKind {
    type Err = TestHostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jasmine" => Ok(Self::Jasmine),
            "mocha" => Ok(Self::Mocha),
            "jest" => Ok(Self::Jest),
            other => Err(TestHostError::config(format!(
                "unknown test framework '{other}' (expected jasmine, mocha or jest)"
            ))),
        }
    }
}

/// Coverage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSettings {
    /// Collect coverage for every run
    pub enabled: bool,
    /// Where the cumulative report is written
    pub output_dir: PathBuf,
    /// Where the test runner drops raw per-session coverage
    pub dump_dir: PathBuf,
}

impl Default for CoverageSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            output_dir: PathBuf::from(DEFAULT_COVERAGE_DIR),
            dump_dir: PathBuf::from(DEFAULT_COVERAGE_DUMP_DIR),
        }
    }
}

/// External runner configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Node executable
    pub node: PathBuf,
    /// Runner script bridging to the test framework
    pub script: Option<PathBuf>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            node: PathBuf::from("node"),
            script: None,
        }
    }
}

/// Process-wide host settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Controller port
    pub port: u16,
    /// Controller address
    pub endpoint: IpAddr,
    /// Optional data-collection port on the same address
    pub data_collection_port: Option<u16>,
    /// Selected test framework
    pub test_framework: TestFrameworkKind,
    /// Coverage configuration
    pub coverage: CoverageSettings,
    /// External runner configuration
    pub runner: RunnerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 0,
            endpoint: IpAddr::V4(Ipv4Addr::LOCALHOST),
            data_collection_port: None,
            test_framework: TestFrameworkKind::default(),
            coverage: CoverageSettings::default(),
            runner: RunnerSettings::default(),
        }
    }
}

impl Settings {
    /// Create settings for a controller port
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Set controller address
    #[must_use]
    pub const fn with_endpoint(mut self, endpoint: IpAddr) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Set data-collection port
    #[must_use]
    pub const fn with_data_collection_port(mut self, port: Option<u16>) -> Self {
        self.data_collection_port = port;
        self
    }

    /// Set test framework
    #[must_use]
    pub const fn with_test_framework(mut self, framework: TestFrameworkKind) -> Self {
        self.test_framework = framework;
        self
    }

    /// Enable or disable coverage
    #[must_use]
    pub const fn with_coverage(mut self, enabled: bool) -> Self {
        self.coverage.enabled = enabled;
        self
    }

    /// Set coverage report directory
    #[must_use]
    pub fn with_coverage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.coverage.output_dir = dir.into();
        self
    }

    /// Set raw coverage dump directory
    #[must_use]
    pub fn with_coverage_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.coverage.dump_dir = dir.into();
        self
    }

    /// Set node executable
    #[must_use]
    pub fn with_node(mut self, node: impl Into<PathBuf>) -> Self {
        self.runner.node = node.into();
        self
    }

    /// Set runner script
    #[must_use]
    pub fn with_runner_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.runner.script = Some(script.into());
        self
    }

    /// Controller socket address
    #[must_use]
    pub const fn endpoint_addr(&self) -> SocketAddr {
        SocketAddr::new(self.endpoint, self.port)
    }

    /// Data-collection socket address, when configured
    #[must_use]
    pub fn data_collection_addr(&self) -> Option<SocketAddr> {
        self.data_collection_port
            .map(|port| SocketAddr::new(self.endpoint, port))
    }

    /// Check the settings are usable
    pub fn validate(&self) -> TestHostResult<()> {
        if self.port == 0 {
            return Err(TestHostError::config("controller port must be non-zero"));
        }
        match self.data_collection_port {
            Some(0) => Err(TestHostError::config(
                "data collection port must be non-zero",
            )),
            Some(port) if port == self.port => Err(TestHostError::config(
                "data collection port must differ from the controller port",
            )),
            _ => Ok(()),
        }
    }
}

/// Per-run settings carried as XML in execution and discovery payloads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSettings {
    /// Run asked for code coverage
    pub enable_code_coverage: bool,
    /// Results directory for this run
    pub results_directory: Option<PathBuf>,
}

impl RunSettings {
    /// Probe the elements the host cares about; everything else is ignored
    #[must_use]
    pub fn from_xml(xml: &str) -> Self {
        static COVERAGE: OnceLock<Option<Regex>> = OnceLock::new();
        static RESULTS: OnceLock<Option<Regex>> = OnceLock::new();

        let coverage = COVERAGE
            .get_or_init(|| Regex::new(r"(?is)<EnableCodeCoverage>\s*(\w+)\s*</EnableCodeCoverage>").ok());
        let results = RESULTS
            .get_or_init(|| Regex::new(r"(?is)<ResultsDirectory>\s*([^<]*?)\s*</ResultsDirectory>").ok());

        let enable_code_coverage = coverage
            .as_ref()
            .and_then(|re| re.captures(xml))
            .and_then(|caps| caps.get(1))
            .is_some_and(|m| m.as_str().eq_ignore_ascii_case("true"));

        let results_directory = results
            .as_ref()
            .and_then(|re| re.captures(xml))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);

        Self {
            enable_code_coverage,
            results_directory,
        }
    }

    /// Whether coverage is active for a run under these host settings
    #[must_use]
    pub const fn coverage_enabled(&self, settings: &Settings) -> bool {
        settings.coverage.enabled || self.enable_code_coverage
    }

    /// Report directory for a run under these host settings
    #[must_use]
    pub fn coverage_output_dir(&self, settings: &Settings) -> PathBuf {
        self.results_directory.as_deref().map_or_else(
            || settings.coverage.output_dir.clone(),
            |dir: &Path| dir.join("coverage"),
        )
    }
}
