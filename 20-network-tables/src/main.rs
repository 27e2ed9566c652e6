use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{self, BufReader};
use tracing::{info, warn};

use network_tables::{
    Client,
    Server,
    cli::{Cli, Command},
    config::{ClientConfig, ServerConfig},
    console,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(ServerConfig::from(&args)).await?,
        Command::Client(args) => run_client(ClientConfig::from(&args)).await?,
    }

    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let server = Server::bind(&config)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let addr = server.local_addr()?;
    info!("server listening on {}", addr);

    let table = Arc::clone(server.handle().table());
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let serving = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));

    let console_result = console::run(
        table,
        BufReader::new(io::stdin()),
        io::stdout(),
        async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        },
    )
    .await;

    let _ = stop_tx.send(());
    if let Err(err) = serving.await? {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }
    console_result
}

async fn run_client(config: ClientConfig) -> Result<()> {
    let client = Client::connect(&config)
        .await
        .with_context(|| format!("failed to connect to {}", config.server))?;

    let result = console::run(
        Arc::clone(client.table()),
        BufReader::new(io::stdin()),
        io::stdout(),
        async {
            let reason = client.closed().await;
            warn!(%reason, "connection closed");
        },
    )
    .await;

    client.close().await;
    result
}
