//! On-disk output: one line-delimited JSON stream per (repository, endpoint).
//!
//! Layout under the output directory:
//!
//! ```text
//! checkpoint.json
//! checkpoint.journal.jsonl
//! manifest.json
//! raw/<owner>__<repo>/<endpoint>.jsonl
//! raw/<login>/discovery.jsonl
//! ```

mod manifest;

pub use manifest::{EndpointCounters, RunManifest};

use crate::errors::{CollectorError, CollectorResult};
use crate::pagination::Page;
use crate::types::{EndpointKind, RepoSummary, RepoTarget, Surface};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, warn};

/// One persisted line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopedRecord {
    /// When the record was fetched.
    pub timestamp: DateTime<Utc>,
    /// Surface it came from.
    pub source: Surface,
    /// Endpoint path of the request.
    pub endpoint: String,
    /// Correlation id of the response that carried it.
    pub request_id: String,
    /// Page number within the stream.
    pub page: u32,
    /// Raw payload.
    pub data: Value,
}

/// Atomically replaces `path` with `data` via a temp file in the same directory.
pub fn atomic_write(path: &Path, data: &[u8]) -> CollectorResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CollectorError::from(e.error))?;
    Ok(())
}

/// Directory name of a stream owner: `owner/repo` becomes `owner__repo`.
pub fn stream_key(owner: &str) -> String {
    owner.replace('/', "__")
}

/// Root of the raw streams, checkpoint and manifest.
#[derive(Debug, Clone)]
pub struct RawStore {
    root: PathBuf,
}

impl RawStore {
    /// Creates a store rooted at `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: output_dir.into(),
        }
    }

    /// Output directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the checkpoint document.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join("checkpoint.json")
    }

    /// Path of the run manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    /// Path of the stream for `owner` (a repository full name or a login).
    pub fn stream_path(&self, owner: &str, endpoint: EndpointKind) -> PathBuf {
        self.root
            .join("raw")
            .join(stream_key(owner))
            .join(format!("{}.jsonl", endpoint.as_str()))
    }

    /// Opens a stream for writing, discarding anything a previous attempt left.
    pub async fn open_writer(
        &self,
        owner: &str,
        endpoint: EndpointKind,
        flush_every: usize,
    ) -> CollectorResult<RecordWriter> {
        let path = self.stream_path(owner, endpoint);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        debug!(path = %path.display(), "Opened record stream");
        Ok(RecordWriter {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
            written: 0,
        })
    }

    /// Removes a stream so later readers see it as empty.
    pub async fn discard(&self, owner: &str, endpoint: EndpointKind) -> CollectorResult<()> {
        let path = self.stream_path(owner, endpoint);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Discarded record stream");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads every record of a stream. A missing stream reads as empty.
    pub async fn read_records(
        &self,
        owner: &str,
        endpoint: EndpointKind,
    ) -> CollectorResult<Vec<EnvelopedRecord>> {
        let path = self.stream_path(owner, endpoint);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EnvelopedRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    return Err(CollectorError::corrupt_state(format!(
                        "{}:{}: {}",
                        path.display(),
                        line_no,
                        e
                    )))
                }
            }
        }
        Ok(records)
    }

    /// Distinct `number` fields of a stream's payloads, ascending.
    pub async fn read_numbers(&self, owner: &str, endpoint: EndpointKind) -> CollectorResult<Vec<u64>> {
        let numbers: BTreeSet<u64> = self
            .read_records(owner, endpoint)
            .await?
            .iter()
            .filter_map(|r| r.data.get("number").and_then(Value::as_u64))
            .collect();
        Ok(numbers.into_iter().collect())
    }

    /// Repositories persisted by discovery for `login`.
    pub async fn read_repo_targets(&self, login: &str) -> CollectorResult<Vec<RepoTarget>> {
        let mut targets = Vec::new();
        for record in self.read_records(login, EndpointKind::Discovery).await? {
            match serde_json::from_value::<RepoSummary>(record.data) {
                Ok(repo) => targets.push(RepoTarget::from(&repo)),
                Err(e) => warn!(error = %e, "Skipping unreadable discovery record"),
            }
        }
        Ok(targets)
    }
}

/// Buffered writer for one stream.
///
/// Records are flushed every `flush_every` appends; [`RecordWriter::finish`]
/// flushes and syncs the file.
pub struct RecordWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
    written: u64,
}

impl RecordWriter {
    /// Path being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Appends one record.
    pub async fn append(&mut self, record: &EnvelopedRecord) -> CollectorResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.written += 1;
        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush().await?;
        }
        Ok(())
    }

    /// Wraps and appends every item of a page. Returns the number written.
    pub async fn append_page(&mut self, endpoint: &str, page: &Page) -> CollectorResult<usize> {
        self.append_items(endpoint, page, page.items.iter()).await
    }

    /// Wraps and appends selected items of a page. Returns the number written.
    pub async fn append_items<'p, I>(&mut self, endpoint: &str, page: &Page, items: I) -> CollectorResult<usize>
    where
        I: IntoIterator<Item = &'p Value>,
    {
        let timestamp = Utc::now();
        let mut count = 0;
        for item in items {
            self.append(&EnvelopedRecord {
                timestamp,
                source: page.surface,
                endpoint: endpoint.to_string(),
                request_id: page.correlation_id.clone(),
                page: page.number,
                data: item.clone(),
            })
            .await?;
            count += 1;
        }
        Ok(count)
    }

    /// Flushes buffered records to the file.
    pub async fn flush(&mut self) -> CollectorResult<()> {
        self.writer.flush().await?;
        self.pending = 0;
        Ok(())
    }

    /// Flushes, syncs and closes the stream. Returns the records written.
    pub async fn finish(mut self) -> CollectorResult<u64> {
        self.flush().await?;
        self.writer.get_ref().sync_all().await?;
        Ok(self.written)
    }
}
