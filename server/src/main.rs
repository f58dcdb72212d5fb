use clap::Parser;
use log::info;
use server::plugin::LifecycleLog;
use server::{MapDefinition, PluginSet, Server, ServerConfig};
use shared::messages::ServerInfo;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Tick rate (updates per second)
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,

    /// Maximum number of concurrent connections
    #[arg(short, long, default_value = "16")]
    max_clients: usize,

    /// Kick every new connection with a "server closed" result
    #[arg(long)]
    temporarily_closed: bool,

    #[arg(long, default_value = "ch1")]
    channel_id: String,

    #[arg(long, default_value = "Channel 1")]
    channel_title: String,

    #[arg(long, default_value = "")]
    channel_description: String,

    /// JSON map definition; the built-in Town01 is used when absent
    #[arg(long)]
    map_file: Option<PathBuf>,

    /// Seconds the readiness gate stays closed after scene activation
    #[arg(long, default_value = "1.0")]
    readiness_delay: f32,

    /// Give up if the scene is not ready after this many seconds
    #[arg(long)]
    readiness_timeout: Option<f32>,

    /// Run without a local player (spawns the server observer)
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    headless: bool,

    /// In-game hours per real second
    #[arg(long, default_value = "0.0166667")]
    time_of_day_speed: f32,

    /// Seconds between online-character refreshes
    #[arg(long, default_value = "1.0")]
    liveness_interval: f32,

    /// Seconds between time-of-day broadcasts
    #[arg(long, default_value = "5.0")]
    time_broadcast_interval: f32,

    /// Minimum milliseconds between physics transform syncs
    #[arg(long, default_value = "8")]
    physics_min_interval_ms: u64,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let map = match &self.map_file {
            Some(path) => MapDefinition::load(path)?,
            None => MapDefinition::town01(),
        };

        Ok(ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            tick_rate: self.tick_rate,
            max_clients: self.max_clients,
            temporarily_closed: self.temporarily_closed,
            server_info: ServerInfo {
                channel_id: self.channel_id,
                title: self.channel_title,
                description: self.channel_description,
            },
            map,
            readiness_delay: Duration::from_secs_f32(self.readiness_delay.max(0.0)),
            readiness_timeout: self
                .readiness_timeout
                .map(|secs| Duration::from_secs_f32(secs.max(0.0))),
            headless: self.headless,
            time_of_day_speed: self.time_of_day_speed,
            liveness_interval: Duration::from_secs_f32(self.liveness_interval.max(0.0)),
            time_broadcast_interval: Duration::from_secs_f32(self.time_broadcast_interval.max(0.0)),
            physics_min_interval: Duration::from_millis(self.physics_min_interval_ms),
            ..ServerConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = args.into_config()?;

    info!("Starting server on {}", config.bind_addr);
    info!("Map: {} ({} static entities)", config.map.info.map_id, config.map.spawns.len());
    if config.temporarily_closed {
        info!("Server is temporarily closed; new connections will be kicked");
    }

    let plugins = PluginSet::new().with(LifecycleLog);
    let mut server = Server::with_plugins(config, plugins).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
