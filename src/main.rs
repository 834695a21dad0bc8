use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

use tli_tracker::catalog::ItemCatalog;
use tli_tracker::config::Config;
use tli_tracker::events::{ChannelSink, LogSink};
use tli_tracker::models::Session;
use tli_tracker::prices::{pinned_price, PriceBook};
use tli_tracker::service::{run_status_ticker, spawn_notification_drain, TrackerService};
use tli_tracker::storage::{
    load_prices, save_prices, DataDir, JsonSessionStore, MemorySessionStore, SessionStore,
};
use tli_tracker::tracker::ChunkStats;
use tli_tracker::watcher::{detect_game_log, split_lines, LogWatcher};
use tli_tracker::web;

#[derive(Parser)]
#[command(name = "tli-tracker", version, about = "Torchlight: Infinite drop and profit tracker")]
struct Cli {
    /// Directory for config, prices and session history
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail the game log and serve the JSON API
    Watch {
        /// Path to UE_game.log (auto-detected when omitted)
        #[arg(long)]
        log: Option<PathBuf>,
        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: String,
        /// Seconds between status log lines
        #[arg(long, default_value_t = 60)]
        status_interval: u64,
    },
    /// Feed a saved log through the tracker and print the final state
    Replay {
        file: PathBuf,
        /// Deliver the file in chunks of this many lines
        #[arg(long)]
        chunk_lines: Option<usize>,
        /// Save sessions and prices to the data directory
        #[arg(long)]
        persist: bool,
    },
    /// List stored sessions
    Sessions {
        #[arg(long, default_value_t = 10)]
        count: usize,
        /// Only sessions started today
        #[arg(long)]
        today: bool,
    },
    /// Show totals across all sessions, or one session
    Summary {
        #[arg(long)]
        session: Option<String>,
    },
    /// Delete a stored session
    DeleteSession { id: String },
    /// List known prices
    Prices,
    /// Set a price manually
    SetPrice { item_id: String, price: f64 },
    /// Show the configuration, or change keys with --set key=value
    Config {
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let data = DataDir::resolve(cli.data_dir)?;
    let config = Config::load(&data.config_path())
        .with_context(|| format!("invalid config at {}", data.config_path().display()))?;

    match cli.command {
        Commands::Watch {
            log,
            addr,
            status_interval,
        } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(watch(data, config, log, addr, status_interval))?;
        }
        Commands::Replay {
            file,
            chunk_lines,
            persist,
        } => replay(&data, config, file, chunk_lines.unwrap_or(0), persist)?,
        Commands::Sessions { count, today } => {
            let store = JsonSessionStore::open(data.sessions_path(), config.max_sessions)?;
            let sessions = if today {
                store.today()
            } else {
                store.recent(count)?
            };
            if sessions.is_empty() {
                println!("No sessions found.");
                return Ok(());
            }
            for session in sessions {
                let status = if session.is_active() { "active" } else { "ended" };
                println!(
                    "{} | {} | {} | maps: {} | value: {:.2}",
                    session.id,
                    session.started_at.format("%Y-%m-%d %H:%M"),
                    status,
                    session.map_count(),
                    session.total_value()
                );
            }
        }
        Commands::Summary { session } => {
            let store = JsonSessionStore::open(data.sessions_path(), config.max_sessions)?;
            match session {
                Some(id) => {
                    let session = store
                        .get(&id)?
                        .ok_or_else(|| anyhow::anyhow!("Session not found"))?;
                    print_session(&session);
                }
                None => {
                    let summary = store.summary();
                    println!("Sessions: {}", summary.total_sessions);
                    println!("Maps: {}", summary.total_maps);
                    println!("Total value: {:.2}", summary.total_value);
                    println!("Items: {}", summary.total_items);
                    println!("Mapping time: {:.1} minutes", summary.total_time_seconds / 60.0);
                    println!("Value/hour: {:.2}", summary.average_value_per_hour);
                    println!("Maps/hour: {:.2}", summary.average_maps_per_hour);
                }
            }
        }
        Commands::DeleteSession { id } => {
            let store = JsonSessionStore::open(data.sessions_path(), config.max_sessions)?;
            if store.delete(&id)? {
                println!("Session deleted: {}", id);
            } else {
                println!("Session not found: {}", id);
            }
        }
        Commands::Prices => {
            let catalog = ItemCatalog::load(&data.items_path())?;
            let book = PriceBook::from_records(load_prices(&data.prices_path())?, config.tax());
            let mut rows: Vec<_> = book.records().iter().collect();
            rows.sort_by(|a, b| a.0.cmp(b.0));
            for (item_id, record) in rows {
                println!(
                    "{} | {} | {:.4} | {:?}",
                    item_id,
                    catalog.name(item_id),
                    record.price,
                    book.price_status(item_id)
                );
            }
        }
        Commands::SetPrice { item_id, price } => {
            if pinned_price(&item_id).is_some() {
                anyhow::bail!("Price of {} is fixed", item_id);
            }
            if !price.is_finite() || price < 0.0 {
                anyhow::bail!("Price must be a non-negative number");
            }
            let mut book = PriceBook::from_records(load_prices(&data.prices_path())?, config.tax());
            book.set_price(&item_id, price);
            save_prices(&data.prices_path(), book.records())?;
            println!("Price set: {} = {:.4}", item_id, price);
        }
        Commands::Config { set } => {
            let config = if set.is_empty() {
                config
            } else {
                let updated = apply_overrides(&config, &set)?;
                updated.save(&data.config_path())?;
                info!(path = %data.config_path().display(), "Configuration saved");
                updated
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn watch(
    data: DataDir,
    config: Config,
    log: Option<PathBuf>,
    addr: String,
    status_interval: u64,
) -> anyhow::Result<()> {
    let log_path = detect_game_log(log.as_deref().or(config.log_path.as_deref()))
        .ok_or_else(|| anyhow::anyhow!("UE_game.log not found; pass --log or set log_path"))?;

    let (sink, notifications) = ChannelSink::pair();
    // Detached: it ends once the engine and its sink are dropped.
    spawn_notification_drain(notifications, LogSink)?;

    let service = TrackerService::open(&data, config, Box::new(sink))?;
    service.set_log_path(Some(log_path.clone()));

    let (chunk_tx, chunk_rx) = mpsc::channel();
    let worker = service.spawn_worker(chunk_rx)?;
    let watcher = LogWatcher::spawn(&log_path, chunk_tx)?;
    let ticker = tokio::spawn(run_status_ticker(
        service.clone(),
        Duration::from_secs(status_interval.max(1)),
    ));

    let served = web::serve(addr, service.clone()).await;

    ticker.abort();
    let _ = ticker.await;
    drop(watcher);
    if worker.join().is_err() {
        warn!("Chunk worker panicked");
    }
    service.flush()?;
    served
}

fn replay(
    data: &DataDir,
    config: Config,
    file: PathBuf,
    chunk_lines: usize,
    persist: bool,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(&file).with_context(|| format!("cannot read {}", file.display()))?;
    let text = String::from_utf8_lossy(&bytes);

    let service = if persist {
        TrackerService::open(data, config, Box::new(LogSink))?
    } else {
        let catalog = Arc::new(ItemCatalog::load(&data.items_path())?);
        let prices = PriceBook::from_records(load_prices(&data.prices_path())?, config.tax());
        TrackerService::in_memory(
            config,
            catalog,
            prices,
            Arc::new(MemorySessionStore::new()),
            Box::new(LogSink),
        )
    };

    let mut totals = ChunkStats::default();
    let chunks = split_lines(&text, chunk_lines);
    for chunk in &chunks {
        let stats = service.process_chunk(chunk);
        totals.events += stats.events;
        totals.drops += stats.drops;
        totals.price_updates += stats.price_updates;
        totals.map_changes += stats.map_changes;
    }
    service.flush()?;
    info!(
        chunks = chunks.len(),
        events = totals.events,
        drops = totals.drops,
        price_updates = totals.price_updates,
        map_changes = totals.map_changes,
        "Replay finished"
    );
    println!("{}", serde_json::to_string_pretty(&service.snapshot())?);
    Ok(())
}

fn print_session(session: &Session) {
    let summary = session.summary();
    println!("Session: {}", summary.id);
    println!("Started: {}", summary.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(ended) = summary.ended_at {
        println!("Ended: {}", ended.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("Maps: {}", summary.map_count);
    println!("Items: {}", summary.total_items);
    println!("Total value: {:.2}", summary.total_value);
    println!("Investment: {:.2}", summary.total_investment);
    println!("Net value: {:.2}", summary.net_value);
    println!("Value/hour: {:.2}", summary.value_per_hour);
    println!("Maps/hour: {:.2}", summary.maps_per_hour);
}

/// Apply `key=value` pairs; values are parsed as JSON, falling back to a string.
fn apply_overrides(config: &Config, pairs: &[String]) -> anyhow::Result<Config> {
    let mut value = serde_json::to_value(config)?;
    let fields = value
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("config is not an object"))?;
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected KEY=VALUE, got '{}'", pair))?;
        let key = key.trim();
        if !fields.contains_key(key) {
            anyhow::bail!("unknown config key '{}'", key);
        }
        let parsed = serde_json::from_str(raw.trim())
            .unwrap_or_else(|_| serde_json::Value::String(raw.trim().to_string()));
        fields.insert(key.to_string(), parsed);
    }
    let updated: Config = serde_json::from_value(value)?;
    updated.validate()?;
    Ok(updated)
}
