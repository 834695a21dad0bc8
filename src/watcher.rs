//! Tails `UE_game.log` and forwards newly appended text in order.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use directories::BaseDirs;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

/// Re-check the file this often even without filesystem events.
const POLL_FALLBACK: Duration = Duration::from_secs(1);

const LOG_SUBPATH: &str = "TorchLight/Saved/Logs/UE_game.log";
const GAME_SUBPATH: &str = "steamapps/common/Torchlight Infinite/UE_game";

/// Reads a growing file from a remembered byte offset.
///
/// Only complete lines are returned; a trailing partial line stays on disk
/// until its newline arrives.
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    position: u64,
}

impl LogTailer {
    /// Start at the current end of the file, skipping existing content.
    pub fn at_end(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let position = std::fs::metadata(&path)?.len();
        Ok(Self { path, position })
    }

    pub fn from_start(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            position: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Newly appended complete lines, lossily decoded. `None` when nothing new.
    pub fn read_new(&mut self) -> io::Result<Option<String>> {
        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len < self.position {
            info!(path = %self.path.display(), "Log truncated, reading from start");
            self.position = 0;
        }
        if len == self.position {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(self.position))?;
        let mut buf = Vec::with_capacity((len - self.position) as usize);
        file.take(len - self.position).read_to_end(&mut buf)?;

        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(None);
        };
        buf.truncate(last_newline + 1);
        self.position += buf.len() as u64;
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }
}

/// Background tailer; dropping it stops the reader thread.
pub struct LogWatcher {
    watcher: Option<RecommendedWatcher>,
    handle: Option<JoinHandle<()>>,
}

impl LogWatcher {
    /// Watch `path` and send every new chunk to `chunks`, starting at the
    /// current end of the file.
    pub fn spawn(path: &Path, chunks: mpsc::Sender<String>) -> anyhow::Result<Self> {
        let mut tailer = LogTailer::at_end(path)
            .with_context(|| format!("cannot open game log {}", path.display()))?;

        let (wake_tx, wake_rx) = mpsc::channel::<()>();
        let file_name = path.file_name().map(|n| n.to_os_string());
        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        let ours = event
                            .paths
                            .iter()
                            .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                        if ours {
                            let _ = wake_tx.send(());
                        }
                    }
                    Err(e) => warn!(error = %e, "File watch error"),
                }
            })?;
        // The game may recreate the file, so watch its directory.
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        let handle = thread::Builder::new()
            .name("log-tailer".into())
            .spawn(move || run_tailer(&mut tailer, wake_rx, chunks))?;
        info!(path = %path.display(), "Watching game log");

        Ok(Self {
            watcher: Some(watcher),
            handle: Some(handle),
        })
    }
}

fn run_tailer(tailer: &mut LogTailer, wake: mpsc::Receiver<()>, chunks: mpsc::Sender<String>) {
    loop {
        match wake.recv_timeout(POLL_FALLBACK) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        // Coalesce bursts of events into one read.
        while wake.try_recv().is_ok() {}

        match tailer.read_new() {
            Ok(Some(chunk)) => {
                debug!(bytes = chunk.len(), position = tailer.position(), "Read log chunk");
                if chunks.send(chunk).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(path = %tailer.path().display(), error = %e, "Failed to read game log"),
        }
    }
    debug!("Log tailer stopped");
}

impl Drop for LogWatcher {
    fn drop(&mut self) {
        // Dropping the watcher closes the wake channel, which ends the reader.
        self.watcher.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Log tailer thread panicked");
            }
        }
    }
}

/// Split saved log text into chunks of at most `lines` lines, the way the
/// tailer would have delivered it. `0` yields a single chunk.
pub fn split_lines(text: &str, lines: usize) -> Vec<&str> {
    if lines == 0 || text.is_empty() {
        return vec![text];
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (idx, _) in text.match_indices('\n') {
        count += 1;
        if count == lines {
            chunks.push(&text[start..=idx]);
            start = idx + 1;
            count = 0;
        }
    }
    if start < text.len() {
        chunks.push(&text[start..]);
    }
    chunks
}

/// Locate `UE_game.log`: the configured override if it exists, otherwise the
/// usual Steam library locations.
pub fn detect_game_log(override_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = override_path {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        warn!(path = %path.display(), "Configured log path does not exist");
    }
    candidate_logs().into_iter().find(|p| p.is_file())
}

fn candidate_logs() -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = [
        "C:/Program Files (x86)/Steam",
        "C:/Program Files/Steam",
        "D:/SteamLibrary",
        "D:/Steam",
        "E:/SteamLibrary",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();
    if let Some(base) = BaseDirs::new() {
        let home = base.home_dir();
        roots.push(home.join(".steam/steam"));
        roots.push(home.join(".local/share/Steam"));
    }
    roots
        .into_iter()
        .map(|root| root.join(GAME_SUBPATH).join(LOG_SUBPATH))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, text: &[u8]) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(text).unwrap();
    }

    #[test]
    fn test_starts_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("UE_game.log");
        std::fs::write(&path, "old line\n").unwrap();

        let mut tailer = LogTailer::at_end(&path).unwrap();
        assert_eq!(tailer.read_new().unwrap(), None);
        append(&path, b"new line\n");
        assert_eq!(tailer.read_new().unwrap().as_deref(), Some("new line\n"));
        assert_eq!(tailer.read_new().unwrap(), None);
    }

    #[test]
    fn test_partial_line_held_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("UE_game.log");
        std::fs::write(&path, "").unwrap();

        let mut tailer = LogTailer::from_start(&path);
        append(&path, b"first\nsec");
        assert_eq!(tailer.read_new().unwrap().as_deref(), Some("first\n"));
        assert_eq!(tailer.read_new().unwrap(), None);
        append(&path, b"ond\n");
        assert_eq!(tailer.read_new().unwrap().as_deref(), Some("second\n"));
    }

    #[test]
    fn test_truncation_rewinds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("UE_game.log");
        std::fs::write(&path, "a fairly long line of text\n").unwrap();

        let mut tailer = LogTailer::at_end(&path).unwrap();
        std::fs::write(&path, "short\n").unwrap();
        assert_eq!(tailer.read_new().unwrap().as_deref(), Some("short\n"));
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("UE_game.log");
        std::fs::write(&path, b"ok \xff\xfe end\n").unwrap();

        let mut tailer = LogTailer::from_start(&path);
        let chunk = tailer.read_new().unwrap().unwrap();
        assert!(chunk.starts_with("ok "));
        assert!(chunk.ends_with(" end\n"));
    }

    #[test]
    fn test_split_lines() {
        assert_eq!(split_lines("a\nb\nc\n", 2), vec!["a\nb\n", "c\n"]);
        assert_eq!(split_lines("a\nb", 1), vec!["a\n", "b"]);
        assert_eq!(split_lines("a\nb\n", 0), vec!["a\nb\n"]);
    }

    #[test]
    fn test_detect_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("UE_game.log");
        std::fs::write(&path, "").unwrap();
        assert_eq!(detect_game_log(Some(&path)), Some(path.clone()));
    }
}
