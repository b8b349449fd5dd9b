use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use taskdock::config::{Paths, Settings};
use taskdock::http::{self, AppState};

#[derive(Parser, Debug)]
#[command(
    name = "taskdock",
    about = "Process supervisor with an HTTP control plane",
    version
)]
struct Cli {
    /// Preferred listen port; the next free adjacent port is used when taken
    #[arg(long)]
    port: Option<u16>,

    /// Base run directory (defaults to $TASKDOCK_HOME or the working directory)
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Launch task commands through a plain non-interactive shell
    #[arg(long)]
    plain_shell: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let paths = Paths::detect(cli.base_dir)?;
    paths.ensure_dirs()?;
    let settings = Settings::load(paths, cli.port, cli.plain_shell)?;
    let state = AppState::new(settings)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(http::serve(state))
}
