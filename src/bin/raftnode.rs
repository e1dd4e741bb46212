use clap::{ArgAction, Parser};
use env_logger::Builder;
use log::{error, info, LevelFilter};
use raftnode::Config;
use std::path::PathBuf;

/// Runs one Raft node of a replicated key-value store.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Identifier of this node
    id: String,
    /// Port to serve on
    port: u16,
    /// Host peers reach this node at
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Comma-separated addresses of the other members
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,
    /// TOML file with timing, consistency and transport settings
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    ::std::process::exit(main_code().await)
}

async fn main_code() -> i32 {
    let args = Args::parse();
    setup_logging(args.verbose);

    let address = format!("{}:{}", args.host, args.port);
    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Could not load config from {}: {}", path.display(), e);
                return 1;
            }
        },
        None => Config::new(&args.id, &address),
    };
    config.id = args.id;
    config.address = address;
    if !args.peers.is_empty() {
        config.peers = args.peers;
    }

    info!("Starting node {} at {}", config.id, config.address);
    match config.spawn_server().await {
        Ok(()) => {
            info!("Node {} stopped", config.id);
            0
        }
        Err(e) => {
            error!("Node {} failed: {}", config.id, e);
            2
        }
    }
}

fn setup_logging(verbosity: u8) {
    let mut builder = Builder::from_default_env();
    match verbosity {
        0 => builder.filter_level(LevelFilter::Warn),
        1 => builder.filter_level(LevelFilter::Info),
        2 => builder.filter_level(LevelFilter::Debug),
        _ => builder.filter_level(LevelFilter::Trace),
    };
    builder.init();
}
