use std::{net::SocketAddr, path::PathBuf, sync::OnceLock};

use clap::Parser;

/// Tracks container logs across recreations and streams them live.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file. A missing file means all defaults.
    #[arg(short, long, default_value = "logkeeper.toml")]
    pub config: PathBuf,

    /// Address to listen on, overriding `listen` from the config file.
    #[arg(long)]
    pub addr: Option<SocketAddr>,

    /// Database path, overriding `database` from the config file.
    #[arg(long)]
    pub db: Option<PathBuf>,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
