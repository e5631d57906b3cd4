// ABOUTME: shellcast binary - runs the execution service
// ABOUTME: Loads config, applies CLI overrides, serves until Ctrl+C or SIGTERM

use anyhow::{Context, Result};
use clap::Parser;
use shellcast_core::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shellcast")]
#[command(about = "Run shell commands over WebSocket with live streamed output")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, env = "SHELLCAST_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides server.bind
    #[arg(long)]
    bind: Option<String>,

    /// Print the default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Write the default configuration to ~/.config/shellcast/config.toml and exit
    #[arg(long)]
    init_config: bool,

    /// Log to ~/.config/shellcast/shellcast/shellcast.log instead of stderr
    #[arg(long)]
    log_file: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", Config::default_toml());
        return Ok(());
    }
    if cli.init_config {
        let path = Config::init()?;
        println!("Config written to {}", path.display());
        return Ok(());
    }

    if cli.log_file {
        shellcast_log::init_file("shellcast");
    } else {
        shellcast_log::init();
    }

    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    shellcast_serve::run(config).await
}
