use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use webserv::config::LogLevel;
use webserv::{logging, signals, Config, Reactor, Router, VirtualHostTable};

#[derive(Parser, Debug)]
#[command(name = "webserv", version, about = "HTTP/1.1 server with virtual hosts and CGI")]
struct Args {
    /// Configuration file
    #[arg(default_value = "config/default.toml")]
    config: PathBuf,

    /// Overrides the configured log level (debug, info, warn, error)
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Check the configuration and exit
    #[arg(short, long)]
    test: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    logging::init(args.log_level.unwrap_or(config.log.level));

    let hosts = VirtualHostTable::from_config(&config)?;
    if args.test {
        println!("configuration file {} test is successful", args.config.display());
        return Ok(());
    }

    signals::install().context("installing signal handlers")?;
    let mut reactor = Reactor::new(
        config.engine.clone(),
        Router::new(hosts).with_cgi_output_limit(config.engine.max_cgi_output_bytes),
    )?;
    info!("webserv started with {} virtual host(s)", config.servers.len());
    reactor.run(&signals::SHUTDOWN)?;
    info!("webserv stopped");
    Ok(())
}
