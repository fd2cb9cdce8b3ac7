use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use album_relay::album::{AlbumGateway, AlbumReplier};
use album_relay::buffer::{CorrelationBuffer, FlushHandler, FlushPolicy};
use album_relay::channels::telegram::TelegramChannel;
use album_relay::channels::{Channel, InboundMessage, MediaItem, OutboundMessage};
use album_relay::config::Config;
use album_relay::error::{RelayError, Result};

#[derive(Parser)]
#[command(name = "album-relay", version, about = "Telegram bot that answers each album once")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default config file
    Init,
    /// Run the bot until Ctrl+C
    Start,
    /// Config management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Open config in editor
    Edit,
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // File + stderr for `start`, stderr only otherwise
    init_tracing(matches!(&cli.command, Commands::Start))?;

    match cli.command {
        Commands::Init => cmd_init(&cli.config)?,
        Commands::Start => cmd_start(&cli.config).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let path = cli.config.unwrap_or_else(Config::default_path);
                let content = std::fs::read_to_string(&path)?;
                println!("{content}");
            }
            ConfigAction::Edit => {
                let path = cli.config.unwrap_or_else(Config::default_path);
                let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
                std::process::Command::new(editor).arg(&path).status()?;
            }
        },
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn relay_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".album-relay")
}

fn log_file_path() -> PathBuf {
    relay_dir().join("album-relay.log")
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    let config_path = path.clone().unwrap_or_else(Config::default_path);
    if !config_path.exists() {
        return Err(RelayError::Config(format!(
            "Config not found at {}. Run `album-relay init` first.",
            config_path.display()
        )));
    }
    Config::load(&config_path)
}

fn init_tracing(with_file: bool) -> std::result::Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if with_file {
            "info".into()
        } else {
            "warn".into()
        }
    });

    let stderr_layer = tracing_subscriber::fmt::layer();

    if with_file {
        let dir = relay_dir();
        let _ = std::fs::create_dir_all(&dir);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file_path())?;

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_init(config_path: &Option<PathBuf>) -> Result<()> {
    let path = config_path.clone().unwrap_or_else(Config::default_path);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    if path.exists() {
        println!("Config already exists at {}", path.display());
    } else {
        std::fs::write(&path, Config::default_toml())?;
        println!("Created config at {}", path.display());
        println!("Set BOT_TOKEN in your environment, then run `album-relay start`.");
    }
    Ok(())
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;

    let tg_config = config
        .channels
        .telegram
        .clone()
        .filter(|t| t.enabled)
        .ok_or_else(|| RelayError::Config("No enabled channel in config".to_string()))?;
    let channel = Arc::new(TelegramChannel::new(tg_config)?);

    let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundMessage>(64);
    let (inbound_tx, inbound_rx) = mpsc::channel::<InboundMessage>(64);

    let replier = Arc::new(AlbumReplier::new(channel.name(), outbound_tx.clone()));
    let buffer = CorrelationBuffer::<MediaItem>::new();
    buffer.configure(FlushPolicy::new(config.album.quiet_period(), replier.clone()))?;
    let gateway = AlbumGateway::new(buffer.clone());

    // Spawn polling loop
    let poller = channel.clone();
    let poll_task = tokio::spawn(async move {
        if let Err(e) = poller.start(inbound_tx, outbound_rx).await {
            tracing::error!("Telegram channel error: {e}");
        }
    });

    // inbound → gateway → (immediate reply | buffer)
    let reply_tx = outbound_tx.clone();
    let route_task = tokio::spawn(async move { gateway.run(inbound_rx, reply_tx).await });

    println!("Album relay v{} started", env!("CARGO_PKG_VERSION"));
    println!("  Channel:      {}", channel.name());
    println!("  Quiet period: {}ms", config.album.quiet_period_ms);
    println!("  Log:          {}", log_file_path().display());
    println!();
    println!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    // The poller may sit in a long-poll; updates it never acknowledged are
    // redelivered on the next start. Cancelling it drops the inbound sender.
    channel.stop().await?;
    poll_task.abort();
    let _ = poll_task.await;

    // Fragments already received reach the buffer before it closes.
    if let Err(e) = route_task.await {
        warn!("Inbound router failed: {e}");
    }

    let pending = buffer.shutdown().await;
    if config.album.flush_on_shutdown {
        for group in pending {
            let key = group.key.clone();
            if let Err(e) = replier.on_flush(group).await {
                warn!(
                    "Failed to answer album {} at shutdown: {e}",
                    key.as_deref().unwrap_or("<none>")
                );
            }
        }
    } else if !pending.is_empty() {
        let items: usize = pending.iter().map(|g| g.len()).sum();
        warn!(
            "Discarding {} pending album(s) ({items} item(s))",
            pending.len()
        );
    }

    // Last outbound senders; the sender task ends once its queue is empty.
    drop(replier);
    drop(outbound_tx);
    if let Err(e) = channel.drain_outbound(Duration::from_secs(10)).await {
        warn!("{e}");
    }

    info!("Album relay stopped");
    println!("Album relay stopped.");
    Ok(())
}
