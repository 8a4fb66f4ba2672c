//! kiln task dispatch daemon.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use kiln::config::{self, Config};

#[derive(Parser)]
#[command(name = "kilnd", version, about = "kiln task dispatch daemon")]
struct Cli {
    /// Listen address; overrides the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the default config to the given path and exit.
    #[arg(long, value_name = "PATH")]
    write_default_config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    kiln::telemetry::init(cli.verbose);

    if let Some(path) = cli.write_default_config {
        return match config::write_config(&path, &Config::default()) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "default config written");
                ExitCode::SUCCESS
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to write config");
                ExitCode::FAILURE
            }
        };
    }

    let mut config = config::load_or_default(cli.config.as_deref());
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    match kiln::daemon::run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "daemon failed");
            ExitCode::FAILURE
        }
    }
}
