use clap::Parser;
use simwatch_runner::{
    config::{RunnerConfig, WalkMode},
    scan::Scanner,
};
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info};

/// Scan a shared project folder for marked simulation jobs and run them on local storage
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// yaml config file, flags and environment variables take precedence over it
    #[arg(short, long, env = "SIMWATCH_CONFIG")]
    config: Option<PathBuf>,
    /// shared root that is scanned for job folders
    #[arg(long, env = "REMOTE_PROJECT_FOLDER")]
    remote_root: Option<PathBuf>,
    /// node-local directory for staging copies
    #[arg(long, env = "EP_WORK_DIR")]
    work_dir: Option<PathBuf>,
    /// natural, random or time
    #[arg(long, env = "WALK_MODE")]
    walk_mode: Option<WalkMode>,
    /// newest folders first when walking by time
    #[arg(long)]
    reverse: bool,
    /// scan a single time and exit
    #[arg(long)]
    once: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "simwatch_runner=info,simwatch=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => match RunnerConfig::load(path) {
            Ok(config) => config,
            Err(error) => {
                error!(error = ?error, "{error}");
                return ExitCode::FAILURE;
            }
        },
        None => RunnerConfig::default(),
    };

    if let Some(remote_root) = cli.remote_root {
        config.remote_root = remote_root;
    }
    if let Some(work_dir) = cli.work_dir {
        config.work_dir = work_dir;
    }
    if let Some(mode) = cli.walk_mode {
        config.walk.mode = mode;
    }
    if cli.reverse {
        config.walk.reverse = true;
    }

    if config.preflight_checks() {
        error!("Config contains errors, please fix them before starting");
        return ExitCode::FAILURE;
    }

    let scanner = match Scanner::load(&config) {
        Ok(scanner) => scanner,
        Err(error) => {
            error!(error = ?error, "{error}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        root = ?scanner.root(),
        work_dir = ?config.work_dir,
        mode = ?config.walk.mode,
        "Starting scan loop"
    );
    scanner.run(cli.once);

    ExitCode::SUCCESS
}
