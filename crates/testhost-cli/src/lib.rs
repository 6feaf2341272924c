//! Probar Test Host CLI
//!
//! Parses launcher arguments into host settings, installs logging and serves
//! the controller until the session ends.

#![warn(missing_docs)]

mod commands;
mod config;
mod error;
mod logging;

pub use commands::Cli;
pub use config::{build_settings, LogConfig};
pub use error::{CliError, CliResult};
pub use logging::{env_filter, init_logging};

use probar_testhost::{
    CoverageEngine, DirectoryCoverageEngine, ExternalRunnerFactory, HostExit, Settings, TestHost,
};
use std::sync::Arc;
use tracing::info;

/// Connect to the controller and serve it until the session ends
pub async fn serve(settings: Settings) -> CliResult<HostExit> {
    let settings = Arc::new(settings);
    let frameworks = Arc::new(ExternalRunnerFactory::new(
        settings.runner.clone(),
        settings.coverage.dump_dir.clone(),
    ));
    let engine: Arc<dyn CoverageEngine> =
        Arc::new(DirectoryCoverageEngine::new(settings.coverage.dump_dir.clone()));

    info!(
        endpoint = %settings.endpoint_addr(),
        framework = %settings.test_framework,
        coverage = settings.coverage.enabled,
        "starting test host"
    );
    let host = TestHost::connect(settings, frameworks, Some(engine)).await?;
    Ok(host.run().await)
}
