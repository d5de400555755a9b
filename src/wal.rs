// =============================================================================
// Write-Ahead Log — append-only intent journal
// =============================================================================
//
// One JSON object per line, ASCII newline terminated. Entries are never
// overwritten; the logical status of an intent is the last entry written for
// its id. Two write modes:
//
//   Critical — the line is written and fsynced before `append` returns.
//              Used for INTENT records: the order must be durable before the
//              venue ever sees it.
//   Buffered — the line is written to the OS buffer; a background task
//              flushes every `wal_flush_ms` (or every 50 entries inline).
//              Used for status updates (COMMITTED/FAILED/CLOSED).
//
// A write or fsync failure poisons the journal: every later append returns
// `WalError::Poisoned` and the engine halts. Replay tolerates a torn final
// line; a corrupted tail never invalidates the prefix.
// =============================================================================

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::WalError;
use crate::types::{Intent, IntentStatus, Side};

/// Buffered entries flushed inline once this many are pending.
const FLUSH_EVERY_ENTRIES: usize = 50;

/// Durability mode for a single append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Written and fsynced synchronously before return.
    Critical,
    /// Enqueued to the OS buffer; flushed by the background task.
    Buffered,
}

// =============================================================================
// Entry format
// =============================================================================

/// One self-describing journal line. Readers tolerate unknown keys; absent
/// optional keys are simply `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically nondecreasing sequence number, stamped at append time.
    #[serde(default)]
    pub seq: u64,
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub status: IntentStatus,
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WalEntry {
    /// Full snapshot of an intent, carrying prices and leverage. Used for the
    /// initial INTENT and for GHOST_ADOPTED records.
    pub fn snapshot(intent: &Intent) -> Self {
        Self {
            seq: 0,
            id: intent.id,
            symbol: intent.symbol.clone(),
            side: intent.side,
            qty: intent.quantity,
            status: intent.status,
            timestamp: Utc::now(),
            entry: Some(intent.entry_price),
            stop: Some(intent.stop_loss),
            take_profit: Some(intent.take_profit),
            leverage: Some(intent.leverage),
            error_code: None,
            error_msg: None,
            reason: None,
        }
    }

    /// A lean status-transition record for an existing id.
    pub fn transition(intent: &Intent, status: IntentStatus) -> Self {
        Self {
            seq: 0,
            id: intent.id,
            symbol: intent.symbol.clone(),
            side: intent.side,
            qty: intent.quantity,
            status,
            timestamp: Utc::now(),
            entry: None,
            stop: None,
            take_profit: None,
            leverage: None,
            error_code: None,
            error_msg: None,
            reason: None,
        }
    }

    pub fn with_error(mut self, code: i64, msg: impl Into<String>) -> Self {
        self.error_code = Some(code);
        self.error_msg = Some(msg.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

// =============================================================================
// Logical state reduction
// =============================================================================

/// Last-write-wins fold of the journal: one latest entry per intent id.
#[derive(Debug, Default)]
pub struct WalState {
    latest: HashMap<Uuid, WalEntry>,
}

impl WalState {
    /// Fold a stream of entries in file order.
    pub fn fold(entries: impl IntoIterator<Item = WalEntry>) -> Self {
        let mut latest: HashMap<Uuid, WalEntry> = HashMap::new();
        for e in entries {
            latest.insert(e.id, e);
        }
        Self { latest }
    }

    pub fn status_of(&self, id: &Uuid) -> Option<IntentStatus> {
        self.latest.get(id).map(|e| e.status)
    }

    pub fn get(&self, id: &Uuid) -> Option<&WalEntry> {
        self.latest.get(id)
    }

    /// All intents whose logical lifecycle is not terminal.
    pub fn open_intents(&self) -> Vec<&WalEntry> {
        self.latest
            .values()
            .filter(|e| !e.status.is_terminal())
            .collect()
    }

    /// Open intents for one symbol.
    pub fn open_for_symbol(&self, symbol: &str) -> Vec<&WalEntry> {
        self.latest
            .values()
            .filter(|e| !e.status.is_terminal() && e.symbol == symbol)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

// =============================================================================
// The journal
// =============================================================================

struct WalInner {
    writer: BufWriter<File>,
    bytes: u64,
    seq: u64,
    pending: usize,
    poisoned: bool,
}

/// Append-only journal with internal serialization of concurrent writers.
pub struct Wal {
    path: PathBuf,
    rotate_bytes: u64,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Open (or create) the journal at `path`. The next sequence number
    /// continues from the highest found across the current and rotated files.
    pub fn open(path: impl Into<PathBuf>, rotate_bytes: u64) -> Result<Self, WalError> {
        let path: PathBuf = path.into();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let bytes = file.metadata()?.len();

        let max_seq = Self::scan_max_seq(&path)?;

        info!(
            path = %path.display(),
            bytes,
            next_seq = max_seq + 1,
            "journal opened"
        );

        Ok(Self {
            path,
            rotate_bytes,
            inner: Mutex::new(WalInner {
                writer: BufWriter::new(file),
                bytes,
                seq: max_seq,
                pending: 0,
                poisoned: false,
            }),
        })
    }

    /// Append one entry. Returns the stamped sequence number.
    pub fn append(&self, mut entry: WalEntry, mode: WriteMode) -> Result<u64, WalError> {
        let mut inner = self.inner.lock();
        if inner.poisoned {
            return Err(WalError::Poisoned);
        }

        inner.seq += 1;
        entry.seq = inner.seq;

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let result = (|| -> Result<(), WalError> {
            inner.writer.write_all(line.as_bytes())?;
            inner.bytes += line.len() as u64;
            inner.pending += 1;

            match mode {
                WriteMode::Critical => {
                    inner.writer.flush()?;
                    inner.writer.get_ref().sync_all()?;
                    inner.pending = 0;
                }
                WriteMode::Buffered => {
                    if inner.pending >= FLUSH_EVERY_ENTRIES {
                        inner.writer.flush()?;
                        inner.writer.get_ref().sync_all()?;
                        inner.pending = 0;
                    }
                }
            }
            Ok(())
        })();

        if let Err(e) = result {
            inner.poisoned = true;
            return Err(e);
        }

        debug!(
            seq = entry.seq,
            id = %entry.id,
            status = %entry.status,
            mode = ?mode,
            "journal append"
        );

        let seq = entry.seq;
        if inner.bytes >= self.rotate_bytes {
            if let Err(e) = Self::rotate_locked(&self.path, &mut inner) {
                inner.poisoned = true;
                return Err(e);
            }
        }

        Ok(seq)
    }

    /// Flush buffered entries to durable storage.
    pub fn flush(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        if inner.poisoned {
            return Err(WalError::Poisoned);
        }
        if inner.pending == 0 {
            return Ok(());
        }
        let result = (|| -> Result<(), WalError> {
            inner.writer.flush()?;
            inner.writer.get_ref().sync_all()?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                inner.pending = 0;
                Ok(())
            }
            Err(e) => {
                inner.poisoned = true;
                Err(e)
            }
        }
    }

    /// Force a rotation regardless of size.
    pub fn rotate(&self) -> Result<PathBuf, WalError> {
        let mut inner = self.inner.lock();
        if inner.poisoned {
            return Err(WalError::Poisoned);
        }
        Self::rotate_locked(&self.path, &mut inner)
    }

    /// Whether a write failure has poisoned the journal.
    pub fn is_poisoned(&self) -> bool {
        self.inner.lock().poisoned
    }

    /// Replay every entry from rotated files (oldest first) then the current
    /// file. Purely a function of on-disk content; buffered entries are
    /// flushed first so the result matches what a restart would see.
    pub fn replay(&self) -> Result<Vec<WalEntry>, WalError> {
        self.flush()?;
        let mut entries = Vec::new();
        for file_path in Self::journal_files(&self.path)? {
            Self::read_file(&file_path, &mut entries);
        }
        Ok(entries)
    }

    /// Replay and fold into logical per-id state.
    pub fn replay_state(&self) -> Result<WalState, WalError> {
        Ok(WalState::fold(self.replay()?))
    }

    /// Final flush on shutdown.
    pub fn close(&self) -> Result<(), WalError> {
        self.flush()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Close the current file, rename it with a timestamp suffix, open fresh.
    /// The zero-padded sequence keeps names unique and lexicographically
    /// ordered even for rotations within the same millisecond.
    fn rotate_locked(path: &Path, inner: &mut WalInner) -> Result<PathBuf, WalError> {
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;

        let rotated = path.with_file_name(format!(
            "{}.{}-{:010}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "wal".to_string()),
            Utc::now().format("%Y%m%dT%H%M%S%3f"),
            inner.seq
        ));

        std::fs::rename(path, &rotated)?;

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        inner.writer = BufWriter::new(file);
        inner.bytes = 0;
        inner.pending = 0;

        info!(rotated = %rotated.display(), "journal rotated");
        Ok(rotated)
    }

    /// Rotated files (sorted by the lexicographic timestamp suffix) followed
    /// by the current file.
    fn journal_files(path: &Path) -> Result<Vec<PathBuf>, WalError> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let prefix = format!("{file_name}.");

        let mut rotated: Vec<PathBuf> = Vec::new();
        let read_dir = match dir {
            Some(d) => std::fs::read_dir(d)?,
            None => std::fs::read_dir(".")?,
        };
        for entry in read_dir.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) {
                rotated.push(entry.path());
            }
        }
        rotated.sort();

        if path.exists() {
            rotated.push(path.to_path_buf());
        }
        Ok(rotated)
    }

    /// Read one journal file, skipping undecodable lines. A torn final line
    /// is expected after a crash and is discarded quietly; mid-file damage is
    /// logged and skipped so the rest of the prefix survives.
    fn read_file(path: &Path, out: &mut Vec<WalEntry>) {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "journal file unreadable, skipping");
                return;
            }
        };

        let reader = BufReader::new(file);
        let lines: Vec<String> = reader.lines().map_while(Result::ok).collect();
        let last_idx = lines.len().saturating_sub(1);

        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WalEntry>(line) {
                Ok(entry) => out.push(entry),
                Err(e) if idx == last_idx => {
                    debug!(
                        path = %path.display(),
                        error = %e,
                        "torn tail line discarded"
                    );
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        line = idx + 1,
                        error = %e,
                        "undecodable journal line skipped"
                    );
                }
            }
        }
    }

    /// Highest sequence number across all journal files (0 when empty).
    fn scan_max_seq(path: &Path) -> Result<u64, WalError> {
        let mut entries = Vec::new();
        for file_path in Self::journal_files(path)? {
            Self::read_file(&file_path, &mut entries);
        }
        Ok(entries.iter().map(|e| e.seq).max().unwrap_or(0))
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("bytes", &inner.bytes)
            .field("seq", &inner.seq)
            .field("poisoned", &inner.poisoned)
            .finish()
    }
}

// =============================================================================
// Background flush task
// =============================================================================

/// Flush buffered entries on a fixed cadence until shutdown. A flush failure
/// poisons the journal; the striker notices on its next append and the engine
/// halts through the normal fatal path.
pub async fn run_flush_task(wal: Arc<Wal>, flush_ms: u64, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(flush_ms.max(10)));
    info!(flush_ms, "journal flush task started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = wal.flush() {
                    warn!(error = %e, "journal background flush failed");
                    return;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = wal.flush();
                    info!("journal flush task stopped");
                    return;
                }
            }
        }
    }
}
