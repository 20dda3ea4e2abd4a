use clap::Parser;
use nimbus::{config::NodeConfig, message::LogMessage, system::System, NimbusError, SystemSnapshot};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Interval between synthetic backend events, in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    interval_ms: u64,

    /// Enable debug mode
    #[arg(short, long)]
    verbose: bool,
}

async fn run(cli: &Cli) -> Result<(), NimbusError> {
    let config: NodeConfig = if cli.config.exists() {
        NodeConfig::from_file(
            cli.config
                .to_str()
                .ok_or_else(|| NimbusError::internal("config path is not valid UTF-8"))?,
        )?
    } else {
        NodeConfig::default()
    };

    info!("config loaded.");
    debug!("config: {:?}", config);

    let system = System::new(&config)?;

    // Watch the live buffer and print every version transition.
    let (_subscription, mut updates) = system.subscribe("mostRecentMessages")?;
    tokio::spawn(async move {
        while let Some(notification) = updates.recv().await {
            println!(
                "-> {} changed, version {}",
                notification.field, notification.version
            );
        }
    });

    // Stand-in for the backend collector: periodic snapshots and log
    // messages until Ctrl+C.
    let interval = Duration::from_millis(cli.interval_ms);
    println!("nimbus status node running. Press Ctrl+C to shutdown.");
    let mut tick: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                tick += 1;
                system.on_log_message(LogMessage::new(format!("synthetic event {}", tick)));
                if tick % 5 == 0 {
                    system.on_system_snapshot(SystemSnapshot::new(serde_json::json!({
                        "tick": tick,
                        "workers": 4,
                    })));
                }
                let status = system.status();
                debug!(
                    total = status.total_messages,
                    buffered = status.buffered_messages,
                    dropped = status.dropped_events,
                    "tick"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    println!("Shutting down...");
    system.shutdown().await?;
    println!("Goodbye.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), NimbusError> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    run(&cli).await
}
