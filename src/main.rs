//! Marketstream CLI - watch market feeds and stream assistant replies.
//!
//! This is the main binary entry point. See the `marketstream` library
//! for the core functionality.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use marketstream::chat::{MemoryThreadStore, SessionUpdate, ThreadStore, TurnOutcome};
use marketstream::market::{kline_channel, utc_offset};
use marketstream::{ChatPipeline, ChatRequest, Config, ConnectionRegistry};
use mimalloc::MiMalloc;
use tokio::sync::broadcast::error::RecvError;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// How long the printer may lag behind a finished turn before we stop waiting.
const PRINTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "marketstream")]
#[command(version)]
#[command(about = "Real-time market feeds and streamed assistant replies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream klines for a symbol until Ctrl-C
    Watch {
        /// Trading pair, e.g. BTCUSDT
        symbol: String,
        /// Kline interval, e.g. 1m
        interval: String,
        /// UTC offset as ±HH:MM, or "local"
        #[arg(long)]
        timezone: Option<String>,
        /// Channel key naming the socket
        #[arg(long, default_value = "market")]
        key: String,
    },
    /// Ask the assistant and print the reply as it arrives
    Chat {
        /// The question
        query: String,
        /// Thread the reply belongs to
        #[arg(long)]
        thread: String,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    match cli.command {
        Commands::Watch {
            symbol,
            interval,
            timezone,
            key,
        } => runtime.block_on(watch(&config, &symbol, &interval, timezone, key)),
        Commands::Chat { query, thread } => runtime.block_on(chat(&config, query, thread)),
        Commands::Config => print_config(&config),
    }
}

fn resolve_timezone(timezone: Option<String>) -> Option<String> {
    match timezone.as_deref() {
        Some("local") => {
            let seconds = chrono::Local::now().offset().local_minus_utc();
            Some(utc_offset(seconds / 60))
        }
        _ => timezone,
    }
}

async fn watch(
    config: &Config,
    symbol: &str,
    interval: &str,
    timezone: Option<String>,
    key: String,
) -> Result<()> {
    let channel = kline_channel(symbol, interval, resolve_timezone(timezone).as_deref());

    let mut registry = ConnectionRegistry::new();
    let supervisor = registry.acquire(config.supervisor_config(key.as_str()));
    let mut states = supervisor.state_changes();
    let mut data = supervisor.messages();

    log::info!("[Watch] Subscribing {} on {}", channel, supervisor.url());
    supervisor.subscribe(channel);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                log::info!("[Watch] Interrupted");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                log::info!("[Watch] {}: {}", key, state);
            }
            message = data.recv() => match message {
                Ok(message) => {
                    let line = serde_json::json!({
                        "topic": message.topic,
                        "data": message.payload,
                    });
                    writeln!(stdout, "{line}")?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("[Watch] Output fell behind, skipped {} messages", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    registry.disconnect_all();
    registry.wait_retired().await;
    Ok(())
}

async fn chat(config: &Config, query: String, thread: String) -> Result<()> {
    if !config.has_api_key() {
        log::warn!("[Chat] MARKETSTREAM_API_KEY is not set");
    }

    let threads = Arc::new(MemoryThreadStore::new());
    let pipeline = ChatPipeline::new(
        config.stream_controller()?,
        Arc::clone(&threads) as Arc<dyn ThreadStore>,
        config.pipeline_config(),
    );

    let request = ChatRequest::new(config.user_id.clone(), thread, query);
    let handle = pipeline.start_turn(&request);

    let printer = {
        let mut updates = pipeline.updates();
        let session_id = handle.session_id().clone();
        tokio::spawn(async move {
            let mut stdout = std::io::stdout();
            let mut current = None;
            loop {
                match updates.recv().await {
                    Ok(SessionUpdate::Delta {
                        session_id: sid,
                        channel,
                        text,
                    }) if sid == session_id => {
                        if current != Some(channel) {
                            let _ = write!(stdout, "\n[{:?}] ", channel);
                            current = Some(channel);
                        }
                        let _ = write!(stdout, "{text}");
                        let _ = stdout.flush();
                    }
                    Ok(SessionUpdate::Finalized { session_id: sid, .. }) if sid == session_id => {
                        let _ = writeln!(stdout);
                        break;
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    // First Ctrl-C shows everything at once, the second abandons the turn.
    let signals = {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("[Chat] Fast-forwarding (Ctrl-C again to abort)");
                handle.fast_forward();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("[Chat] Aborting");
                handle.abort();
            }
        })
    };

    let outcome = pipeline.run_turn(&handle, &request).await;
    signals.abort();
    if tokio::time::timeout(PRINTER_DRAIN_TIMEOUT, printer).await.is_err() {
        log::debug!("[Chat] Printer did not finish in time");
    }
    pipeline.close().await;

    match outcome {
        TurnOutcome::Completed | TurnOutcome::Cancelled => Ok(()),
        failed => anyhow::bail!("Chat turn {}", failed),
    }
}

fn print_config(config: &Config) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    println!(
        "api_key: {}",
        if config.has_api_key() { "set" } else { "not set" }
    );
    println!("config_dir: {}", Config::config_dir()?.display());
    Ok(())
}
