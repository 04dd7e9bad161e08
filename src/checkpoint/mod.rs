//! Durable record of which units of work and phases are done.
//!
//! State lives in two files: a compact JSON snapshot (`checkpoint.json`) and an
//! append-only journal next to it (`checkpoint.journal.jsonl`). Every
//! transition appends one line to the journal and syncs it, so a crash loses
//! at most the unit that was in flight. Opening the store replays the journal
//! over the snapshot and folds both back into a fresh snapshot.
//!
//! Units found `in_progress` when the state is loaded are demoted to
//! `not_started`: their partial output is not trusted and they run again from
//! the first page.

use crate::errors::{CollectorError, CollectorErrorKind, CollectorResult};
use crate::storage::atomic_write;
use crate::types::{EndpointKind, Phase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Current document format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Journal entries appended before the store compacts on its own.
pub const COMPACT_EVERY: usize = 4096;

/// Path of the journal that accompanies the snapshot at `path`.
pub fn journal_path(path: &Path) -> PathBuf {
    path.with_extension("journal.jsonl")
}

/// Persisted status tag of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Never run, or demoted after an interrupted run.
    NotStarted,
    /// Owned by a running collector.
    InProgress,
    /// Finished; output stream is complete.
    Complete,
    /// Finished with an error.
    Failed,
}

/// Persisted state of one `(repository, endpoint)` unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    /// Status tag.
    pub status: UnitState,
    /// Message of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Whether the last failure may succeed on a later run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Time of the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl UnitRecord {
    fn new(status: UnitState) -> Self {
        Self {
            status,
            last_error: None,
            retryable: None,
            updated_at: Some(Utc::now()),
        }
    }
}

/// The checkpoint document as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDocument {
    /// Format version.
    pub version: u32,
    /// Units, keyed by repository full name (or target login for discovery).
    #[serde(default)]
    pub repositories: BTreeMap<String, BTreeMap<EndpointKind, UnitRecord>>,
    /// Phase completion flags.
    #[serde(default)]
    pub phases: BTreeMap<Phase, bool>,
}

impl Default for CheckpointDocument {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            repositories: BTreeMap::new(),
            phases: BTreeMap::new(),
        }
    }
}

impl CheckpointDocument {
    /// Demotes every `in_progress` unit to `not_started`. Returns how many were demoted.
    fn demote_in_progress(&mut self) -> usize {
        let mut demoted = 0;
        for units in self.repositories.values_mut() {
            for record in units.values_mut() {
                if record.status == UnitState::InProgress {
                    record.status = UnitState::NotStarted;
                    demoted += 1;
                }
            }
        }
        demoted
    }

    fn record(&self, repo: &str, endpoint: EndpointKind) -> Option<&UnitRecord> {
        self.repositories.get(repo).and_then(|units| units.get(&endpoint))
    }

    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Unit {
                repository,
                endpoint,
                record,
            } => {
                self.repositories
                    .entry(repository)
                    .or_default()
                    .insert(endpoint, record);
            }
            JournalEntry::Phase { phase } => {
                self.phases.insert(phase, true);
            }
        }
    }
}

/// One line of the journal.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Unit {
        repository: String,
        endpoint: EndpointKind,
        record: UnitRecord,
    },
    Phase {
        phase: Phase,
    },
}

/// Applies every journal line to `doc`. Returns how many were applied.
///
/// A final line without its newline is what a crash mid-append leaves behind;
/// it is dropped with a warning. Any other unreadable line is an error.
fn replay(doc: &mut CheckpointDocument, bytes: &[u8], path: &Path) -> CollectorResult<usize> {
    let mut applied = 0;
    let mut lines = bytes.split(|b| *b == b'\n').enumerate().peekable();
    while let Some((index, line)) = lines.next() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<JournalEntry>(line) {
            Ok(entry) => {
                doc.apply(entry);
                applied += 1;
            }
            Err(e) if lines.peek().is_none() => {
                warn!(path = %path.display(), line = index + 1, error = %e, "Dropping torn journal entry");
            }
            Err(e) => {
                return Err(CollectorError::corrupt_state(format!(
                    "Checkpoint journal {}:{} is unreadable: {}",
                    path.display(),
                    index + 1,
                    e
                ))
                .with_cause(e))
            }
        }
    }
    Ok(applied)
}

/// Status of a unit as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    /// Not run yet in a way that counts.
    NotStarted,
    /// Currently owned by a collector of this process.
    InProgress,
    /// Done.
    Complete,
    /// Done with an error.
    Failed {
        /// Error message.
        message: String,
        /// Whether a later run should try again.
        retryable: bool,
    },
}

impl UnitStatus {
    /// Returns true for `Complete`.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Returns true when the unit needs no further work: complete, or failed for good.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Complete
                | Self::Failed {
                    retryable: false,
                    ..
                }
        )
    }
}

impl From<&UnitRecord> for UnitStatus {
    fn from(record: &UnitRecord) -> Self {
        match record.status {
            UnitState::NotStarted => Self::NotStarted,
            UnitState::InProgress => Self::InProgress,
            UnitState::Complete => Self::Complete,
            UnitState::Failed => Self::Failed {
                message: record.last_error.clone().unwrap_or_default(),
                retryable: record.retryable.unwrap_or(true),
            },
        }
    }
}

/// In-memory document plus the open journal.
#[derive(Debug)]
struct Ledger {
    doc: CheckpointDocument,
    journal: File,
    appended: usize,
}

/// Owner of the checkpoint document.
///
/// Every transition takes the lock, appends to the journal and updates the
/// in-memory document before releasing the lock, so writes are never reordered.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    journal_path: PathBuf,
    compact_every: usize,
    ledger: Mutex<Ledger>,
}

impl CheckpointStore {
    /// Loads the snapshot at `path` and its journal, or starts an empty
    /// document if there is neither.
    pub async fn open(path: impl Into<PathBuf>) -> CollectorResult<Self> {
        let path = path.into();
        let mut doc = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<CheckpointDocument>(&bytes).map_err(|e| {
                CollectorError::corrupt_state(format!(
                    "Checkpoint {} is unreadable: {}",
                    path.display(),
                    e
                ))
                .with_cause(e)
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CheckpointDocument::default(),
            Err(e) => return Err(e.into()),
        };

        let journal_path = journal_path(&path);
        let replayed = match tokio::fs::read(&journal_path).await {
            Ok(bytes) => replay(&mut doc, &bytes, &journal_path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let demoted = doc.demote_in_progress();
        info!(
            path = %path.display(),
            repositories = doc.repositories.len(),
            completed_phases = doc.phases.values().filter(|done| **done).count(),
            replayed_entries = replayed,
            demoted_units = demoted,
            "Checkpoint loaded"
        );

        if let Some(parent) = journal_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .await?;

        let store = Self {
            path,
            journal_path,
            compact_every: COMPACT_EVERY,
            ledger: Mutex::new(Ledger {
                doc,
                journal,
                appended: 0,
            }),
        };
        if replayed > 0 || demoted > 0 {
            store.compact().await?;
        }
        Ok(store)
    }

    /// Compacts on its own after `entries` journal entries instead of [`COMPACT_EVERY`].
    pub fn compact_every(mut self, entries: usize) -> Self {
        self.compact_every = entries.max(1);
        self
    }

    /// Location of the snapshot.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Location of the journal.
    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    /// Copy of the current document.
    pub async fn document(&self) -> CheckpointDocument {
        self.ledger.lock().await.doc.clone()
    }

    /// Returns true if the unit is complete.
    pub async fn is_unit_complete(&self, repo: &str, endpoint: EndpointKind) -> bool {
        self.unit_status(repo, endpoint).await.is_complete()
    }

    /// Current status of a unit.
    pub async fn unit_status(&self, repo: &str, endpoint: EndpointKind) -> UnitStatus {
        self.ledger
            .lock()
            .await
            .doc
            .record(repo, endpoint)
            .map(UnitStatus::from)
            .unwrap_or(UnitStatus::NotStarted)
    }

    /// Returns true if the unit should run: not started, or failed retryably.
    pub async fn needs_run(&self, repo: &str, endpoint: EndpointKind) -> bool {
        !self.unit_status(repo, endpoint).await.is_settled()
    }

    /// Claims a unit for execution.
    pub async fn mark_in_progress(&self, repo: &str, endpoint: EndpointKind) -> CollectorResult<()> {
        self.transition(repo, endpoint, UnitRecord::new(UnitState::InProgress))
            .await
    }

    /// Marks a unit complete.
    pub async fn mark_complete(&self, repo: &str, endpoint: EndpointKind) -> CollectorResult<()> {
        self.transition(repo, endpoint, UnitRecord::new(UnitState::Complete))
            .await
    }

    /// Marks a unit failed.
    pub async fn mark_failed(
        &self,
        repo: &str,
        endpoint: EndpointKind,
        message: impl Into<String>,
        retryable: bool,
    ) -> CollectorResult<()> {
        let mut record = UnitRecord::new(UnitState::Failed);
        record.last_error = Some(message.into());
        record.retryable = Some(retryable);
        self.transition(repo, endpoint, record).await
    }

    /// Returns a unit to `not_started`, dropping any recorded failure.
    pub async fn reset_unit(&self, repo: &str, endpoint: EndpointKind) -> CollectorResult<()> {
        self.transition(repo, endpoint, UnitRecord::new(UnitState::NotStarted))
            .await
    }

    /// Returns true if the phase was marked complete.
    pub async fn is_phase_complete(&self, phase: Phase) -> bool {
        self.ledger
            .lock()
            .await
            .doc
            .phases
            .get(&phase)
            .copied()
            .unwrap_or(false)
    }

    /// Marks a phase complete.
    pub async fn mark_phase_complete(&self, phase: Phase) -> CollectorResult<()> {
        let mut ledger = self.ledger.lock().await;
        self.append(&mut ledger, JournalEntry::Phase { phase }).await?;
        debug!(phase = %phase, "Phase checkpointed");
        Ok(())
    }

    /// Returns true if every `(repo, endpoint)` unit is complete or failed for good.
    pub async fn units_settled(&self, endpoints: &[EndpointKind], repos: &[String]) -> bool {
        let ledger = self.ledger.lock().await;
        repos.iter().all(|repo| {
            endpoints.iter().all(|endpoint| {
                ledger
                    .doc
                    .record(repo, *endpoint)
                    .map(|r| UnitStatus::from(r).is_settled())
                    .unwrap_or(false)
            })
        })
    }

    /// Writes the whole document as a new snapshot and empties the journal.
    pub async fn compact(&self) -> CollectorResult<()> {
        let mut ledger = self.ledger.lock().await;
        self.write_snapshot(&mut ledger).await
    }

    async fn transition(&self, repo: &str, endpoint: EndpointKind, record: UnitRecord) -> CollectorResult<()> {
        let mut ledger = self.ledger.lock().await;
        let state = record.status;
        let entry = JournalEntry::Unit {
            repository: repo.to_string(),
            endpoint,
            record,
        };
        self.append(&mut ledger, entry).await?;
        debug!(repository = %repo, endpoint = %endpoint, state = ?state, "Unit checkpointed");
        Ok(())
    }

    async fn append(&self, ledger: &mut Ledger, entry: JournalEntry) -> CollectorResult<()> {
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        ledger.journal.write_all(&line).await?;
        ledger.journal.flush().await?;
        ledger.journal.sync_data().await?;
        ledger.doc.apply(entry);
        ledger.appended += 1;
        if ledger.appended >= self.compact_every {
            self.write_snapshot(ledger).await?;
        }
        Ok(())
    }

    async fn write_snapshot(&self, ledger: &mut Ledger) -> CollectorResult<()> {
        let bytes = serde_json::to_vec(&ledger.doc)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&path, &bytes))
            .await
            .map_err(|e| {
                CollectorError::new(
                    CollectorErrorKind::Io,
                    format!("Checkpoint write task failed: {}", e),
                )
            })??;
        ledger.journal.set_len(0).await?;
        ledger.journal.sync_data().await?;
        debug!(path = %self.path.display(), folded_entries = ledger.appended, "Checkpoint compacted");
        ledger.appended = 0;
        Ok(())
    }
}
