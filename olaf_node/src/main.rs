// src/main.rs
use clap::Parser;
use tracing_subscriber::EnvFilter;

use olaf_node::config::NodeConfig;

#[derive(Parser)]
#[command(name = "olaf-node", about = "OLAF/Neighbourhood chat server", version)]
struct Cli {
    /// Address to listen on and advertise to the neighbourhood
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port for the WebSocket and file endpoints
    #[arg(long, default_value_t = 4678)]
    port: u16,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match NodeConfig::from_env(cli.host, cli.port) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(2);
        }
    };

    if let Err(e) = olaf_node::run(config).await {
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}
