//! The change ledger: the only artifact restore depends on.
//!
//! Entries stream into an append-only ndjson journal while a run is in
//! flight, then finalize into a pretty-printed JSON array via a temp file
//! and an atomic rename. `load` accepts both shapes, because an interrupted
//! run leaves only the journal behind.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fsops::write_atomic;
use crate::planner::PhysicalOp;
use crate::{AppError, AppResult};

const JOURNAL_SUFFIX: &str = "journal";
const MAX_BUFFERED_ENTRIES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Rename,
    FieldRewrite,
}

/// One reversible change. Entries are flat and independent: no entry needs
/// another applied first to reverse correctly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    /// Owning scope: the asset's filesystem path for renames, the item id
    /// (or `settings`) for field rewrites.
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<PhysicalOp>,
    pub old: String,
    pub new: String,
}

impl ChangeRecord {
    pub fn rename(
        scope: impl Into<String>,
        op: PhysicalOp,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Self {
        ChangeRecord {
            kind: ChangeKind::Rename,
            scope: scope.into(),
            field: None,
            op: Some(op),
            old: old.into(),
            new: new.into(),
        }
    }

    pub fn field_rewrite(
        scope: impl Into<String>,
        field: impl Into<String>,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Self {
        ChangeRecord {
            kind: ChangeKind::FieldRewrite,
            scope: scope.into(),
            field: Some(field.into()),
            op: None,
            old: old.into(),
            new: new.into(),
        }
    }

    pub fn inverted(&self) -> ChangeRecord {
        let mut entry = self.clone();
        std::mem::swap(&mut entry.old, &mut entry.new);
        entry
    }
}

/// Swap old/new on every entry.
pub fn invert(entries: &[ChangeRecord]) -> Vec<ChangeRecord> {
    entries.iter().map(ChangeRecord::inverted).collect()
}

/// Streaming ledger writer; see the module docs for the lifecycle.
pub struct LedgerWriter {
    path: PathBuf,
    journal_path: PathBuf,
    journal: File,
    buffer: Vec<ChangeRecord>,
    written: u64,
}

impl LedgerWriter {
    /// Create the ledger files under `log_dir` before anything destructive
    /// runs; failure here aborts the run.
    pub fn create(log_dir: &Path) -> AppResult<Self> {
        fs::create_dir_all(log_dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "ledger_create_dir")
                .with_context("path", log_dir.display().to_string())
        })?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let run = Uuid::new_v4().simple().to_string();
        let path = log_dir.join(format!("change_ledger_{stamp}_{}.json", &run[..8]));
        let journal_path = sidecar_path(&path, JOURNAL_SUFFIX);

        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "ledger_journal_create")
                    .with_context("path", journal_path.display().to_string())
            })?;

        Ok(LedgerWriter {
            path,
            journal_path,
            journal,
            buffer: Vec::new(),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written + self.buffer.len() as u64
    }

    pub fn push(&mut self, entry: ChangeRecord) {
        self.buffer.push(entry);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = ChangeRecord>) {
        self.buffer.extend(entries);
    }

    pub fn flush_if_needed(&mut self) -> AppResult<()> {
        if self.buffer.len() >= MAX_BUFFERED_ENTRIES {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> AppResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let entries = std::mem::take(&mut self.buffer);
        for entry in &entries {
            let line = serde_json::to_vec(entry)
                .map_err(|err| AppError::from(err).with_context("operation", "ledger_encode"))?;
            self.journal.write_all(&line).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "ledger_journal_write")
                    .with_context("path", self.journal_path.display().to_string())
            })?;
            self.journal.write_all(b"\n").map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "ledger_journal_write")
                    .with_context("path", self.journal_path.display().to_string())
            })?;
        }
        self.journal.sync_data().map_err(|err| {
            AppError::from(err)
                .with_context("operation", "ledger_journal_sync")
                .with_context("path", self.journal_path.display().to_string())
        })?;
        self.written += entries.len() as u64;
        Ok(())
    }

    /// Flush, rewrite the journal as a pretty JSON array, and drop the
    /// journal. Returns the final ledger path.
    pub fn finalize(mut self) -> AppResult<PathBuf> {
        self.flush()?;
        self.journal.sync_all().map_err(|err| {
            AppError::from(err)
                .with_context("operation", "ledger_journal_sync")
                .with_context("path", self.journal_path.display().to_string())
        })?;
        drop(self.journal);

        let entries = parse_journal(&fs::read(&self.journal_path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "ledger_journal_read")
                .with_context("path", self.journal_path.display().to_string())
        })?)
        .map_err(|err| err.with_context("path", self.journal_path.display().to_string()))?;

        let serialized = serde_json::to_vec_pretty(&entries)
            .map_err(|err| AppError::from(err).with_context("operation", "ledger_encode"))?;
        write_atomic(&self.path, &serialized)
            .map_err(|err| err.with_context("operation", "ledger_finalize"))?;
        fs::remove_file(&self.journal_path).ok();
        Ok(self.path)
    }
}

/// Load a ledger for restore. Any unreadable shape is fatal: a partial
/// restore from a corrupt ledger is unsafe.
pub fn load(path: &Path) -> AppResult<Vec<ChangeRecord>> {
    let data = fs::read(path).map_err(|err| {
        AppError::new("LEDGER/MISSING", "Ledger file could not be read.")
            .with_context("path", path.display().to_string())
            .with_cause(AppError::from(err))
    })?;

    if let Ok(entries) = serde_json::from_slice::<Vec<ChangeRecord>>(&data) {
        return Ok(entries);
    }

    parse_journal(&data).map_err(|err| {
        AppError::new("LEDGER/UNREADABLE", "Ledger file is corrupt.")
            .with_context("path", path.display().to_string())
            .with_cause(err)
    })
}

fn parse_journal(data: &[u8]) -> AppResult<Vec<ChangeRecord>> {
    let mut entries = Vec::new();
    for (idx, line) in data.split(|byte| *byte == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let entry: ChangeRecord = serde_json::from_slice(line).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "ledger_journal_decode")
                .with_context("line", (idx + 1).to_string())
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    if let Some(name) = path.file_name() {
        path.with_file_name(format!("{}.{}", name.to_string_lossy(), suffix))
    } else {
        path.with_extension(suffix)
    }
}
