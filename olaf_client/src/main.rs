// src/main.rs
use clap::Parser;
use tracing_subscriber::EnvFilter;

use olaf_client::Client;

#[derive(Parser)]
#[command(name = "olaf-client", about = "OLAF/Neighbourhood chat client", version)]
struct Cli {
    /// Home server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Home server port
    #[arg(long, default_value_t = 4678)]
    port: u16,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli).await {
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    tracing::info!("generating keypair...");
    let (mut client, incoming) = Client::connect(&cli.host, cli.port).await?;
    tracing::info!(fingerprint = %client.fingerprint(), "this is us");

    client.hello()?;
    client.request_client_list()?;

    tokio::select! {
        _ = client.run(incoming) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }
    Ok(())
}
