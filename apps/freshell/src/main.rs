use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use freshell_core::config::Config;
use freshell_core::server;

/// Terminal session server for browser clients.
#[derive(Parser, Debug)]
#[command(name = "freshell", version, about)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "FRESHELL_HOST")]
    host: Option<String>,

    /// Port to listen on.
    #[arg(long, env = "FRESHELL_PORT")]
    port: Option<u16>,

    /// Shared auth token clients must present in `hello`.
    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(token) = cli.token {
        config.auth_token = token;
    }

    tokio::select! {
        result = server::run(config) => {
            if let Err(err) = result {
                error!("server error: {err}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}
