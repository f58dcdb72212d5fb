use clap::Parser;
use client::{Client, ClientConfig, ClientOutcome};
use log::{info, warn};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    #[arg(short = 'u', long, default_value = "guest")]
    user_id: String,

    #[arg(short = 'c', long, default_value = "guest_character")]
    character_id: String,

    /// Seconds to wait for the safe-disconnect acknowledgement
    #[arg(long, default_value = "2.0")]
    safe_disconnect_timeout: f32,

    /// Seconds to wait for any other request's response
    #[arg(long, default_value = "5.0")]
    request_timeout: f32,

    /// Local chat line to send once in game
    #[arg(long)]
    chat: Option<String>,

    /// Leave safely after this many seconds in game
    #[arg(long)]
    stay: Option<f32>,
}

impl Args {
    fn into_config(self) -> ClientConfig {
        ClientConfig {
            server_addr: self.server,
            user_id: self.user_id,
            character_id: self.character_id,
            safe_disconnect_timeout: Duration::from_secs_f32(self.safe_disconnect_timeout.max(0.0)),
            request_timeout: Duration::from_secs_f32(self.request_timeout.max(0.0)),
            chat: self.chat,
            stay_in_game: self.stay.map(|secs| Duration::from_secs_f32(secs.max(0.0))),
            ..ClientConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = args.into_config();
    info!("Joining {} as {}/{}", config.server_addr, config.user_id, config.character_id);

    let mut client = Client::new(config).await?;
    let shutdown = client.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, leaving the game");
            let _ = shutdown.send(());
        }
    });

    match client.run().await? {
        ClientOutcome::Completed => info!("Left the game"),
        ClientOutcome::Rejected(code) => warn!("Rejected: {}", code.message_key()),
        ClientOutcome::Kicked(code) => warn!("Kicked: {}", code.message_key()),
        ClientOutcome::ConnectionLost => warn!("Connection to the server was lost"),
    }

    Ok(())
}
