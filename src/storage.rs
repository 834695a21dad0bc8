use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use chrono::Local;
use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::models::{per_hour, Session, SessionSummary};
use crate::prices::PriceRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to resolve data directory")]
    NoDataDir,
    #[error("session writer stopped")]
    WriterClosed,
}

// ── Data directory ────────────────────────────────────────────────────

/// Location of all files the tracker persists.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Use `override_dir` when given, otherwise the platform data directory.
    pub fn resolve(override_dir: Option<PathBuf>) -> Result<Self, StoreError> {
        let root = match override_dir {
            Some(dir) => dir,
            None => ProjectDirs::from("com", "tli", "tli-tracker")
                .ok_or(StoreError::NoDataDir)?
                .data_local_dir()
                .to_path_buf(),
        };
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn sessions_path(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    pub fn prices_path(&self) -> PathBuf {
        self.root.join("prices.json")
    }

    pub fn items_path(&self) -> PathBuf {
        self.root.join("items.json")
    }
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Serialize to a uniquely named sibling temp file and rename over the target.
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let pretty = serde_json::to_string_pretty(value)?;
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("json.{}.{}.tmp", std::process::id(), seq));
    fs::write(&tmp, pretty)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

// ── Prices ────────────────────────────────────────────────────────────

pub fn load_prices(path: &Path) -> Result<HashMap<String, PriceRecord>, StoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

pub fn save_prices(path: &Path, prices: &HashMap<String, PriceRecord>) -> Result<(), StoreError> {
    write_json_atomic(path, prices)
}

// ── Session store ─────────────────────────────────────────────────────

/// Persistence of session history, most recent first.
pub trait SessionStore: Send + Sync {
    fn create(&self) -> Session {
        Session::new()
    }

    /// Insert or replace by id.
    fn save(&self, session: &Session) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Result<Option<Session>, StoreError>;

    fn delete(&self, id: &str) -> Result<bool, StoreError>;

    fn recent(&self, count: usize) -> Result<Vec<Session>, StoreError>;
}

/// Aggregate figures across stored sessions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistorySummary {
    pub total_sessions: usize,
    pub total_value: f64,
    pub total_maps: usize,
    pub total_time_seconds: f64,
    pub total_items: i64,
    pub average_value_per_hour: f64,
    pub average_maps_per_hour: f64,
}

pub fn summarize(sessions: &[Session]) -> HistorySummary {
    let summaries: Vec<SessionSummary> = sessions.iter().map(Session::summary).collect();
    let total_value = summaries.iter().map(|s| s.total_value).sum();
    let total_maps = summaries.iter().map(|s| s.map_count).sum::<usize>();
    let total_time_seconds = summaries.iter().map(|s| s.total_duration).sum();
    HistorySummary {
        total_sessions: summaries.len(),
        total_value,
        total_maps,
        total_time_seconds,
        total_items: summaries.iter().map(|s| s.total_items).sum(),
        average_value_per_hour: per_hour(total_value, total_time_seconds),
        average_maps_per_hour: per_hour(total_maps as f64, total_time_seconds),
    }
}

#[derive(Serialize, Deserialize, Default)]
struct SessionFile {
    #[serde(default)]
    sessions: Vec<Session>,
}

/// Sessions kept in a single `sessions.json`, capped at `max_sessions`.
pub struct JsonSessionStore {
    path: PathBuf,
    max_sessions: usize,
    sessions: Mutex<Vec<Session>>,
}

impl JsonSessionStore {
    pub fn open(path: impl Into<PathBuf>, max_sessions: usize) -> Result<Self, StoreError> {
        let path = path.into();
        let sessions = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str::<SessionFile>(&contents)?.sessions
        } else {
            fs::write(&path, json!({ "sessions": [] }).to_string())?;
            Vec::new()
        };
        debug!(path = %path.display(), sessions = sessions.len(), "Opened session store");
        Ok(Self {
            path,
            max_sessions: max_sessions.max(1),
            sessions: Mutex::new(sessions),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn all(&self) -> Vec<Session> {
        self.sessions.lock().clone()
    }

    /// Sessions started today (local time).
    pub fn today(&self) -> Vec<Session> {
        let today = Local::now().date_naive();
        self.sessions
            .lock()
            .iter()
            .filter(|s| s.started_at.with_timezone(&Local).date_naive() == today)
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> HistorySummary {
        summarize(&self.sessions.lock())
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock();
        sessions.clear();
        self.write(&sessions)
    }

    fn write(&self, sessions: &[Session]) -> Result<(), StoreError> {
        write_json_atomic(&self.path, &json!({ "sessions": sessions }))
    }
}

impl SessionStore for JsonSessionStore {
    fn save(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock();
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session.clone(),
            None => sessions.insert(0, session.clone()),
        }
        sessions.truncate(self.max_sessions);
        self.write(&sessions)
    }

    fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.lock().iter().find(|s| s.id == id).cloned())
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|s| s.id != id);
        if sessions.len() == before {
            return Ok(false);
        }
        self.write(&sessions)?;
        Ok(true)
    }

    fn recent(&self, count: usize) -> Result<Vec<Session>, StoreError> {
        Ok(self.sessions.lock().iter().take(count).cloned().collect())
    }
}

/// In-memory store for dry runs and tests.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<Vec<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock();
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session.clone(),
            None => sessions.insert(0, session.clone()),
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.lock().iter().find(|s| s.id == id).cloned())
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|s| s.id != id);
        Ok(sessions.len() != before)
    }

    fn recent(&self, count: usize) -> Result<Vec<Session>, StoreError> {
        Ok(self.sessions.lock().iter().take(count).cloned().collect())
    }
}

// ── Background writer ─────────────────────────────────────────────────

enum WriteJob {
    Save(Box<Session>),
    Flush(mpsc::Sender<()>),
}

/// Health of the background writer, readable from any thread.
#[derive(Debug, Default)]
pub struct WriterStatus {
    pending: AtomicUsize,
    failed: AtomicU64,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriterHealth {
    pub pending_writes: usize,
    pub failed_writes: u64,
    pub last_error: Option<String>,
}

impl WriterStatus {
    pub fn health(&self) -> WriterHealth {
        WriterHealth {
            pending_writes: self.pending.load(Ordering::SeqCst),
            failed_writes: self.failed.load(Ordering::SeqCst),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Defers session writes to one worker thread so chunk processing never waits
/// on disk. A single FIFO consumer applies writes in the order they were issued.
pub struct SessionWriter {
    tx: Mutex<Option<mpsc::Sender<WriteJob>>>,
    inner: Arc<dyn SessionStore>,
    status: Arc<WriterStatus>,
    handle: Option<JoinHandle<()>>,
}

impl SessionWriter {
    pub fn spawn(inner: Arc<dyn SessionStore>) -> Result<Self, StoreError> {
        let (tx, rx) = mpsc::channel::<WriteJob>();
        let status = Arc::new(WriterStatus::default());
        let worker_store = Arc::clone(&inner);
        let worker_status = Arc::clone(&status);
        let handle = thread::Builder::new()
            .name("session-writer".into())
            .spawn(move || run_writer(rx, worker_store, worker_status))?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            inner,
            status,
            handle: Some(handle),
        })
    }

    pub fn status(&self) -> Arc<WriterStatus> {
        Arc::clone(&self.status)
    }

    /// Block until every write issued so far has been applied.
    pub fn flush(&self) -> Result<(), StoreError> {
        let (done_tx, done_rx) = mpsc::channel();
        self.send(WriteJob::Flush(done_tx))?;
        done_rx.recv().map_err(|_| StoreError::WriterClosed)
    }

    fn send(&self, job: WriteJob) -> Result<(), StoreError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(StoreError::WriterClosed)?;
        tx.send(job).map_err(|_| StoreError::WriterClosed)
    }
}

fn run_writer(rx: mpsc::Receiver<WriteJob>, store: Arc<dyn SessionStore>, status: Arc<WriterStatus>) {
    for job in rx {
        match job {
            WriteJob::Save(session) => {
                if let Err(e) = store.save(&session) {
                    error!(session_id = %session.id, error = %e, "Failed to persist session");
                    status.failed.fetch_add(1, Ordering::SeqCst);
                    *status.last_error.lock() = Some(e.to_string());
                }
                status.pending.fetch_sub(1, Ordering::SeqCst);
            }
            WriteJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Session writer stopped");
}

impl SessionStore for SessionWriter {
    fn save(&self, session: &Session) -> Result<(), StoreError> {
        self.status.pending.fetch_add(1, Ordering::SeqCst);
        let sent = self.send(WriteJob::Save(Box::new(session.clone())));
        if sent.is_err() {
            self.status.pending.fetch_sub(1, Ordering::SeqCst);
        }
        sent
    }

    fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.flush()?;
        self.inner.get(id)
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.flush()?;
        self.inner.delete(id)
    }

    fn recent(&self, count: usize) -> Result<Vec<Session>, StoreError> {
        self.flush()?;
        self.inner.recent(count)
    }
}

impl Drop for SessionWriter {
    fn drop(&mut self) {
        self.tx.lock().take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Session writer thread panicked");
            } else {
                info!("Session writes flushed");
            }
        }
    }
}
