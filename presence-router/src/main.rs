use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use presence_router::{
    broker::MemoryBroker,
    cli::{Cli, Command},
    client,
    queue::QueueClient,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let config = args.config();
            let queue = QueueClient::connect(Arc::new(MemoryBroker::new()), config.retry).await;
            let listener = TcpListener::bind(SocketAddr::new(args.host, args.port)).await?;
            let server = Server::new(listener, Arc::new(queue), config);
            let addr = server.local_addr()?;
            info!("server listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
