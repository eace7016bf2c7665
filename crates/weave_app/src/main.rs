mod cli;
mod config;
mod run;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use cli::{Cli, Command};
use config::AppConfig;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::InitConfig { force } = cli.command {
        return run::run_init_config(&cli.config, force);
    }

    let mut config = AppConfig::load(&cli.config)?;
    match &cli.command {
        Command::Gate(args) | Command::Standalone(args) => args.apply(&mut config),
        Command::Node(args) => args.apply(&mut config),
        _ => {}
    }
    if cli.debug {
        config.logging.filter = "debug".to_string();
    }

    // Token output goes to stdout only.
    if let Command::Token(args) = &cli.command {
        return run::run_token(&config, args);
    }

    let _guard = weave_core::init_logging(&config.logging)?;
    info!(version = VERSION, config = %cli.config.display(), "Starting weave");

    match cli.command {
        Command::Gate(_) => run::run_gate(config).await,
        Command::Node(_) => run::run_node(config).await,
        Command::Standalone(_) => run::run_standalone(config).await,
        Command::Ping(args) => run::run_ping(&config, &args).await,
        Command::Token(_) | Command::InitConfig { .. } => Ok(()),
    }
}
