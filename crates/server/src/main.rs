mod config;
mod server;
mod simulation;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use config::SimulationConfig;
use netsync::ServerConfig;
use server::GameServer;

#[derive(Parser)]
#[command(name = "netsync-server")]
#[command(about = "Authoritative state synchronization server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = netsync::DEFAULT_PORT)]
    port: u16,

    #[arg(short = 'r', long, default_value_t = netsync::DEFAULT_UPDATE_RATE)]
    update_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_players: u32,

    #[arg(long, default_value_t = 10_000, help = "Read timeout in ms")]
    read_timeout: u64,

    #[arg(long, default_value_t = 5_000, help = "Write timeout in ms")]
    write_timeout: u64,

    #[arg(long, default_value_t = 1_000, help = "Ping interval in ms")]
    ping_interval: u64,

    #[arg(long, default_value_t = netsync::net::DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    #[arg(long, default_value_t = 5_000, help = "Maximum lag compensation rewind in ms")]
    max_rewind: u64,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            address: format!("{}:{}", self.bind, self.port),
            max_players: self.max_players,
            read_timeout: Duration::from_millis(self.read_timeout),
            write_timeout: Duration::from_millis(self.write_timeout),
            ping_interval: Duration::from_millis(self.ping_interval),
            update_rate: self.update_rate.max(1),
            buffer_size: self.buffer_size,
        }
    }

    fn simulation_config(&self) -> SimulationConfig {
        SimulationConfig {
            max_rewind: Duration::from_millis(self.max_rewind),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut server = GameServer::new(args.server_config(), args.simulation_config());
    server.start().await?;

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await;

    log::info!("Server shutting down");
    server.shutdown().await;
    Ok(())
}
