use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

mod config;
mod observability;

use config::{Config, ConfigError};
use observability::ObservabilityError;

#[derive(Parser)]
#[command(name = "herald", about = "Configuration change notification service")]
enum CliCommand {
    /// Serve long polls until the process is stopped
    Run {
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Load and check a config file, then exit
    Validate {
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    InvalidConfig(#[from] notifier::config::ValidationError),
    #[error(transparent)]
    Observability(#[from] ObservabilityError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Notifier(#[from] notifier::NotifierError),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let result = match cli {
        CliCommand::Run { config } => run(&config),
        CliCommand::Validate { config } => validate(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("herald: {err}");
            ExitCode::FAILURE
        }
    }
}

fn validate(path: &std::path::Path) -> Result<(), CliError> {
    let config = Config::from_file(path)?;
    config.notifier.validate()?;
    println!("{}: ok", path.display());
    Ok(())
}

fn run(path: &std::path::Path) -> Result<(), CliError> {
    let config = Config::from_file(path)?;
    config.notifier.validate()?;

    let _guard = observability::init_logging(config.common.logging.as_ref())?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        if let Some(metrics) = &config.common.metrics {
            observability::init_metrics(metrics)?;
        }
        tracing::info!(config = %path.display(), "starting herald");
        notifier::run(config.notifier).await?;
        Ok::<(), CliError>(())
    })
}
