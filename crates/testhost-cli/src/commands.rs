//! CLI argument definitions using clap

use clap::Parser;
use probar_testhost::{TestFrameworkKind, DEFAULT_COVERAGE_DIR, DEFAULT_COVERAGE_DUMP_DIR};
use std::net::IpAddr;
use std::path::PathBuf;

/// Probar test host: serves JavaScript test discovery and execution for a
/// test platform controller
#[derive(Parser, Debug)]
#[command(name = "probar-testhost")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Controller port to connect to
    #[arg(long, env = "PROBAR_TESTHOST_PORT")]
    pub port: u16,

    /// Controller address
    #[arg(long, env = "PROBAR_TESTHOST_ENDPOINT", default_value = "127.0.0.1")]
    pub endpoint: IpAddr,

    /// Data collector port for test start/end notifications
    #[arg(long = "datacollectionport", env = "PROBAR_TESTHOST_DATACOLLECTIONPORT")]
    pub data_collection_port: Option<u16>,

    /// Test framework (jasmine, mocha, jest)
    #[arg(long, env = "PROBAR_TESTHOST_FRAMEWORK", default_value = "mocha")]
    pub framework: TestFrameworkKind,

    /// Collect code coverage for every run
    #[arg(long, env = "PROBAR_TESTHOST_COVERAGE")]
    pub coverage: bool,

    /// Coverage report directory
    #[arg(long, env = "PROBAR_TESTHOST_COVERAGE_OUTPUT", default_value = DEFAULT_COVERAGE_DIR)]
    pub coverage_dir: PathBuf,

    /// Directory the runner dumps raw coverage into
    #[arg(long, env = "PROBAR_TESTHOST_COVERAGE_DUMP_DIR", default_value = DEFAULT_COVERAGE_DUMP_DIR)]
    pub coverage_dump_dir: PathBuf,

    /// Node executable
    #[arg(long, env = "PROBAR_TESTHOST_NODE", default_value = "node")]
    pub node: PathBuf,

    /// Runner script that drives the test framework
    #[arg(long, env = "PROBAR_TESTHOST_RUNNER")]
    pub runner: Option<PathBuf>,

    /// Log filter directive (e.g. info, probar_testhost=debug)
    #[arg(long, env = "PROBAR_TESTHOST_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "PROBAR_TESTHOST_LOG_JSON")]
    pub log_json: bool,

    /// Write diagnostics to this file instead of stderr
    #[arg(long, env = "PROBAR_TESTHOST_DIAG")]
    pub diag: Option<PathBuf>,

    /// Launcher role (accepted for compatibility)
    #[arg(long, hide = true)]
    pub role: Option<String>,

    /// Launcher process id (accepted for compatibility)
    #[arg(long = "parentprocessid", hide = true)]
    pub parent_process_id: Option<u32>,
}
