//! Runtime wiring around the tracker.
//!
//! All engine mutation goes through one `parking_lot::Mutex`; log chunks are
//! consumed by a single worker thread in arrival order, so readers never see
//! a half-applied chunk.

use std::io;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::catalog::ItemCatalog;
use crate::config::{Config, ConfigError};
use crate::events::{Notification, NotificationSink, TrackerSnapshot};
use crate::prices::PriceBook;
use crate::storage::{
    load_prices, save_prices, DataDir, JsonSessionStore, SessionStore, SessionWriter, StoreError,
    WriterStatus,
};
use crate::tracker::{ChunkStats, Tracker};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub log_path: Option<PathBuf>,
    pub initialized: bool,
    pub in_map: bool,
    pub pending_searches: usize,
    pub pending_writes: usize,
    pub failed_writes: u64,
    pub last_error: Option<String>,
}

/// Cloneable handle shared by the chunk worker, API handlers and the ticker.
#[derive(Clone)]
pub struct TrackerService {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Mutex<Tracker>,
    store: Arc<dyn SessionStore>,
    writer_status: Option<Arc<WriterStatus>>,
    config: Mutex<Config>,
    config_path: Option<PathBuf>,
    prices_path: Option<PathBuf>,
    /// Held across snapshot and write so saves land in acceptance order.
    price_write: Mutex<()>,
    log_path: Mutex<Option<PathBuf>>,
}

impl TrackerService {
    /// Load catalog, prices and history from `data` and start the session writer.
    pub fn open(
        data: &DataDir,
        config: Config,
        sink: Box<dyn NotificationSink>,
    ) -> anyhow::Result<Self> {
        let catalog = Arc::new(ItemCatalog::load(&data.items_path())?);
        let prices = PriceBook::from_records(load_prices(&data.prices_path())?, config.tax());
        let history: Arc<dyn SessionStore> = Arc::new(JsonSessionStore::open(
            data.sessions_path(),
            config.max_sessions,
        )?);
        let writer = SessionWriter::spawn(history)?;
        let writer_status = writer.status();
        let store: Arc<dyn SessionStore> = Arc::new(writer);

        info!(
            data_dir = %data.root().display(),
            items = catalog.len(),
            prices = prices.records().len(),
            "Tracker data loaded"
        );
        let tracker = Tracker::new(&config, catalog, prices, Arc::clone(&store), sink);
        Ok(Self::from_parts(Inner {
            engine: Mutex::new(tracker),
            store,
            writer_status: Some(writer_status),
            config: Mutex::new(config),
            config_path: Some(data.config_path()),
            prices_path: Some(data.prices_path()),
            price_write: Mutex::new(()),
            log_path: Mutex::new(None),
        }))
    }

    /// Nothing is written to disk; used for dry runs.
    pub fn in_memory(
        config: Config,
        catalog: Arc<ItemCatalog>,
        prices: PriceBook,
        store: Arc<dyn SessionStore>,
        sink: Box<dyn NotificationSink>,
    ) -> Self {
        let tracker = Tracker::new(&config, catalog, prices, Arc::clone(&store), sink);
        Self::from_parts(Inner {
            engine: Mutex::new(tracker),
            store,
            writer_status: None,
            config: Mutex::new(config),
            config_path: None,
            prices_path: None,
            price_write: Mutex::new(()),
            log_path: Mutex::new(None),
        })
    }

    fn from_parts(inner: Inner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Run `f` with exclusive access to the engine.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut Tracker) -> R) -> R {
        let mut engine = self.inner.engine.lock();
        f(&mut engine)
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        self.inner.engine.lock().snapshot()
    }

    pub fn store(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn config(&self) -> Config {
        self.inner.config.lock().clone()
    }

    pub fn set_log_path(&self, path: Option<PathBuf>) {
        *self.inner.log_path.lock() = path;
    }

    /// Feed one chunk through the engine and save prices if they changed.
    pub fn process_chunk(&self, chunk: &str) -> ChunkStats {
        let (stats, dirty) = {
            let mut engine = self.inner.engine.lock();
            let stats = engine.process_chunk(chunk);
            (stats, engine.take_prices_dirty())
        };
        if dirty {
            self.write_prices();
        }
        stats
    }

    /// Consume chunks until every sender is dropped.
    pub fn spawn_worker(&self, chunks: mpsc::Receiver<String>) -> io::Result<JoinHandle<()>> {
        let service = self.clone();
        thread::Builder::new()
            .name("tracker-engine".into())
            .spawn(move || {
                for chunk in chunks {
                    let stats = service.process_chunk(&chunk);
                    if stats.events > 0 {
                        debug!(
                            events = stats.events,
                            drops = stats.drops,
                            prices = stats.price_updates,
                            "Processed chunk"
                        );
                    }
                }
                info!("Chunk worker stopped");
            })
    }

    /// Manual price override, saved immediately.
    pub fn set_price(&self, item_id: &str, price: f64) {
        self.with_engine(|engine| {
            engine.set_price(item_id, price);
            engine.take_prices_dirty();
        });
        self.write_prices();
    }

    fn write_prices(&self) {
        let Some(path) = self.inner.prices_path.as_deref() else {
            return;
        };
        // Snapshot under the write lock; the last save then holds every update.
        let _guard = self.inner.price_write.lock();
        let records = self.with_engine(|engine| engine.prices().records().clone());
        if let Err(e) = save_prices(path, &records) {
            error!(path = %path.display(), error = %e, "Failed to save prices");
        }
    }

    /// Validate, persist and apply a new configuration.
    pub fn update_config(&self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        if let Some(path) = self.inner.config_path.as_deref() {
            config.save(path)?;
        }
        self.with_engine(|engine| engine.update_config(&config));
        *self.inner.config.lock() = config;
        info!("Configuration updated");
        Ok(())
    }

    /// Block until queued session writes are on disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        // Reads through the writer wait for the queue to drain.
        self.inner.store.recent(0).map(|_| ())
    }

    pub fn health(&self) -> ServiceHealth {
        let (initialized, in_map, pending_searches) = self.with_engine(|engine| {
            (
                engine.is_initialized(),
                engine.in_map(),
                engine.pending_searches(),
            )
        });
        let writer = self.inner.writer_status.as_ref().map(|s| s.health());
        ServiceHealth {
            log_path: self.inner.log_path.lock().clone(),
            initialized,
            in_map,
            pending_searches,
            pending_writes: writer.as_ref().map_or(0, |w| w.pending_writes),
            failed_writes: writer.as_ref().map_or(0, |w| w.failed_writes),
            last_error: writer.and_then(|w| w.last_error),
        }
    }
}

/// Forward notifications from a [`crate::events::ChannelSink`] to `sink` on
/// their own thread, off the engine lock.
pub fn spawn_notification_drain(
    notifications: mpsc::Receiver<Notification>,
    mut sink: impl NotificationSink + 'static,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("notifications".into())
        .spawn(move || {
            for notification in notifications {
                if let Err(e) = sink.notify(&notification) {
                    warn!(event = notification.kind(), error = %e, "Notification dropped");
                }
            }
        })
}

/// Periodically log a one-line status summary.
pub async fn run_status_ticker(service: TrackerService, period: Duration) {
    let mut interval = tokio::time::interval(period);
    // First tick fires immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        let snapshot = service.snapshot();
        let health = service.health();
        match &snapshot.session {
            Some(session) => info!(
                in_map = snapshot.in_map,
                maps = session.map_count,
                value = session.value,
                value_per_hour = session.value_per_hour,
                pending_writes = health.pending_writes,
                "Status"
            ),
            None => info!(
                initialized = snapshot.initialized,
                awaiting_init = snapshot.awaiting_init,
                pending_writes = health.pending_writes,
                "Status: no active session"
            ),
        }
        if health.failed_writes > 0 {
            warn!(
                failed = health.failed_writes,
                last_error = health.last_error.as_deref().unwrap_or(""),
                "Session writes have failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelSink, LogSink};
    use crate::storage::{load_prices, MemorySessionStore};

    const REFUGE: &str = "01SD/XZ_YuJinZhiXiBiNanSuo200/XZ_YuJinZhiXiBiNanSuo200";

    fn scene(last: &str, next: &str) -> String {
        format!(
            "PageApplyBase@ _UpdateGameEnd: LastSceneName = World'/Game/Art/Maps/{last}' NextSceneName = World'/Game/Art/Maps/{next}'\n"
        )
    }

    fn price_chunk(item: &str, price: f64) -> String {
        format!(
            "----Socket SendMessage STT----XchgSearchPrice----SynId = 9\n+refer [{item}]\n\
             ----Socket RecvMessage STT----XchgSearchPrice----SynId = 9\n+1 [{price}]\n\
             ----Socket RecvMessage End----\n"
        )
    }

    fn memory_service() -> TrackerService {
        TrackerService::in_memory(
            Config::default(),
            Arc::new(ItemCatalog::embedded()),
            PriceBook::default(),
            Arc::new(MemorySessionStore::new()),
            Box::new(LogSink),
        )
    }

    #[test]
    fn test_worker_processes_chunks_in_order() {
        let service = memory_service();
        let (tx, rx) = mpsc::channel();
        let worker = service.spawn_worker(rx).unwrap();
        tx.send(scene(REFUGE, "02KD/Map/Map")).unwrap();
        tx.send(scene("02KD/Map/Map", REFUGE)).unwrap();
        tx.send(scene(REFUGE, "02KD/Map/Map")).unwrap();
        drop(tx);
        worker.join().unwrap();

        let snapshot = service.snapshot();
        assert!(snapshot.in_map);
        let session = snapshot.session.unwrap();
        assert_eq!(session.map_count, 1);
    }

    #[test]
    fn test_prices_saved_when_changed() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::resolve(Some(dir.path().to_path_buf())).unwrap();
        let service = TrackerService::open(&data, Config::default(), Box::new(LogSink)).unwrap();

        service.process_chunk(&price_chunk("5010", 7.5));
        let saved = load_prices(&data.prices_path()).unwrap();
        assert_eq!(saved.get("5010").map(|r| r.price), Some(7.5));

        service.set_price("5020", 3.0);
        let saved = load_prices(&data.prices_path()).unwrap();
        assert_eq!(saved.get("5020").map(|r| r.price), Some(3.0));
    }

    #[test]
    fn test_concurrent_price_saves_keep_every_update() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::resolve(Some(dir.path().to_path_buf())).unwrap();
        let service = TrackerService::open(&data, Config::default(), Box::new(LogSink)).unwrap();

        let writers: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|prefix| {
                let service = service.clone();
                thread::spawn(move || {
                    for n in 0..50 {
                        service.set_price(&format!("{prefix}{n}"), 1.0);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let saved = load_prices(&data.prices_path()).unwrap();
        for n in 0..50 {
            assert!(saved.contains_key(&format!("a{n}")), "missing a{n}");
            assert!(saved.contains_key(&format!("b{n}")), "missing b{n}");
        }
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_sessions_persist_through_writer() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::resolve(Some(dir.path().to_path_buf())).unwrap();
        let service = TrackerService::open(&data, Config::default(), Box::new(LogSink)).unwrap();
        service.process_chunk(&scene(REFUGE, "02KD/Map/Map"));
        service.process_chunk(&scene("02KD/Map/Map", REFUGE));
        service.flush().unwrap();

        let history = JsonSessionStore::open(data.sessions_path(), 100).unwrap();
        assert_eq!(history.all().len(), 1);
        assert_eq!(history.all()[0].maps.len(), 1);
        assert_eq!(service.health().pending_writes, 0);
    }

    #[test]
    fn test_health_reports_engine_state() {
        let service = memory_service();
        service.set_log_path(Some(PathBuf::from("UE_game.log")));
        service.process_chunk(
            "----Socket SendMessage STT----XchgSearchPrice----SynId = 4\n+refer [5010]\n----Socket SendMessage End----\n",
        );
        service.process_chunk(&scene(REFUGE, "02KD/Map/Map"));

        let health = service.health();
        assert_eq!(health.log_path, Some(PathBuf::from("UE_game.log")));
        assert!(!health.initialized);
        assert!(health.in_map);
        assert_eq!(health.pending_searches, 1);
        assert_eq!(health.failed_writes, 0);
        assert!(health.last_error.is_none());
    }

    #[test]
    fn test_update_config_validates_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::resolve(Some(dir.path().to_path_buf())).unwrap();
        let service = TrackerService::open(&data, Config::default(), Box::new(LogSink)).unwrap();

        let bad = Config {
            tax_rate: 1.5,
            ..Config::default()
        };
        assert!(service.update_config(bad).is_err());

        let good = Config {
            tax_enabled: true,
            ..Config::default()
        };
        service.update_config(good).unwrap();
        assert!(service.config().tax_enabled);
        assert!(Config::load(&data.config_path()).unwrap().tax_enabled);
        assert!(service.with_engine(|e| e.prices().tax().enabled));
    }

    #[test]
    fn test_notification_drain_forwards() {
        let (sink, rx) = ChannelSink::pair();
        let (fwd, fwd_rx) = ChannelSink::pair();
        let drain = spawn_notification_drain(rx, fwd).unwrap();
        let service = TrackerService::in_memory(
            Config::default(),
            Arc::new(ItemCatalog::embedded()),
            PriceBook::default(),
            Arc::new(MemorySessionStore::new()),
            Box::new(sink),
        );
        service.with_engine(|e| e.reset_all());
        drop(service);
        drain.join().unwrap();
        let kinds: Vec<&str> = fwd_rx.iter().map(|n| n.kind()).collect();
        assert_eq!(kinds, vec!["reset", "state"]);
    }
}
