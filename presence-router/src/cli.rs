use std::{net::IpAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{queue::RetryPolicy, server::ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the router, accepting client connections over TCP.
    Server(ServerArgs),
    /// Connect to a router as a terminal user.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long)]
    pub port: u16,

    /// Maximum number of simultaneously connected clients.
    #[arg(long, default_value_t = 10)]
    pub max_clients: usize,

    /// Seconds to wait between attempts to reach the message broker.
    #[arg(long, default_value_t = 5)]
    pub broker_backoff_secs: u64,

    /// Seconds a new connection has to send its username.
    #[arg(long, default_value_t = 10)]
    pub handshake_timeout_secs: u64,
}

impl ServerArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            max_clients: self.max_clients,
            retry: RetryPolicy::fixed(Duration::from_secs(self.broker_backoff_secs)),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the router.
    #[arg(long)]
    pub host: IpAddr,

    /// Port of the router.
    #[arg(long)]
    pub port: u16,

    /// Name to register under.
    #[arg(long)]
    pub username: String,
}
