use anyhow::{Result, bail};
use clap::Parser;
use socks5d::{ServerConfig, Socks5Server, auth::UserPass};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "A lightweight SOCKS5 proxy", long_about = None)]
struct Args {
    /// Listener address
    #[arg(short, long, default_value = "127.0.0.1:1080")]
    listen: String,

    /// Username for SOCKS5 proxy
    #[arg(short, long)]
    username: Option<String>,

    /// Password for SOCKS5 proxy
    #[arg(short, long)]
    password: Option<String>,

    /// Seconds a client may stay idle before its request is relayed
    #[arg(short, long, default_value_t = 300)]
    timeout: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    // Check for auth and grab it if present
    let auth = match (args.username, args.password) {
        (Some(u), Some(p)) => {
            info!("Authentication enabled");
            Some(UserPass::new(u, p))
        }
        (None, None) => None,
        _ => bail!("[ERR] must provide both username and password (or neither)"),
    };

    let config = ServerConfig {
        listen_addr: args.listen,
        idle_timeout: Duration::from_secs(args.timeout),
    };

    let mut server = Socks5Server::with_config(config).with_auth(auth)?;

    info!("Starting SOCKS5 proxy: {}", server.config.listen_addr);
    server.run().await
}
