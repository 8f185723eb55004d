use std::process::ExitCode;

use clap::Parser;

use jobgate_infra::CoordinatorConfig;
use jobgate_runner::app::{self, EXIT_ERROR};
use jobgate_runner::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    jobgate_observability::init();
    let cli = Cli::parse();

    let result = match CoordinatorConfig::from_env() {
        Ok(config) => app::execute(cli, config).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "runner failed");
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}
