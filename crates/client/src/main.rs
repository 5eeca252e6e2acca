mod bot;
mod stats;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use bot::{Bot, BotConfig};
use netsync::{ClientConfig, NetworkClient};

#[derive(Parser)]
#[command(name = "netsync-client")]
#[command(about = "Headless client that predicts, reconciles and interpolates")]
struct Args {
    #[arg(
        short,
        long,
        default_value = "127.0.0.1:27015",
        help = "Server address to connect to"
    )]
    server: String,

    #[arg(short = 'r', long, default_value_t = netsync::DEFAULT_UPDATE_RATE)]
    update_rate: u32,

    #[arg(long, default_value_t = 5_000, help = "Connection timeout in ms")]
    connect_timeout: u64,

    #[arg(long, default_value_t = 1_000, help = "Ping interval in ms")]
    ping_interval: u64,

    #[arg(long, default_value_t = 5_000, help = "Longest tolerated unanswered ping in ms")]
    max_latency: u64,

    #[arg(long, default_value_t = 100, help = "Interpolation delay in ms")]
    interpolation_delay: u64,

    #[arg(long, default_value_t = 0, help = "Fire every N frames (0 disables)")]
    fire_every: u32,

    #[arg(long, help = "Stop after this many seconds")]
    duration: Option<u64>,
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            server_address: self.server.clone(),
            connection_timeout: Duration::from_millis(self.connect_timeout),
            ping_interval: Duration::from_millis(self.ping_interval),
            max_latency: Duration::from_millis(self.max_latency),
            ..Default::default()
        }
    }

    fn bot_config(&self) -> BotConfig {
        BotConfig {
            update_rate: self.update_rate.max(1),
            move_speed: netsync::prediction::DEFAULT_MOVE_SPEED,
            orbit_period: 8.0,
            fire_every: self.fire_every,
            interpolation_delay: Duration::from_millis(self.interpolation_delay),
            history_capacity: netsync::snapshot::DEFAULT_HISTORY_CAPACITY,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = args.client_config();
    let timeout = config.connection_timeout;
    let mut client = NetworkClient::new(config);
    let player_id = client
        .connect(timeout)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    let duration = args.duration.map(Duration::from_secs);
    let mut bot = Bot::new(client, player_id, args.bot_config());
    bot.run(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        };
        match duration {
            Some(duration) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = tokio::time::sleep(duration) => log::info!("Run time elapsed"),
                }
            }
            None => ctrl_c.await,
        }
    })
    .await?;

    log::info!("Disconnected");
    Ok(())
}
