//! Append-only record of completed translations, optionally mirrored to a
//! JSON-lines file so it survives restarts.

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::job::CompletedRecord;

pub const HISTORY_FILE_NAME: &str = "history.jsonl";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total: usize,
    pub per_collection: BTreeMap<String, usize>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

pub struct CompletionHistory {
    records: Mutex<Vec<CompletedRecord>>,
    log_file: Mutex<Option<BufWriter<File>>>,
    path: Option<PathBuf>,
}

impl CompletionHistory {
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            log_file: Mutex::new(None),
            path: None,
        }
    }

    /// Loads any records already in `path` and appends new ones to it.
    pub fn with_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            Self::load(&path)?
        } else {
            Vec::new()
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            records: Mutex::new(records),
            log_file: Mutex::new(Some(BufWriter::new(file))),
            path: Some(path),
        })
    }

    /// Reads a history file; malformed lines are skipped.
    pub fn load(path: &Path) -> io::Result<Vec<CompletedRecord>> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CompletedRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(
                    "ignoring line {} of {}: {err}",
                    index + 1,
                    path.display()
                ),
            }
        }
        Ok(records)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn append(&self, record: CompletedRecord) {
        if let Ok(mut guard) = self.log_file.lock() {
            if let Some(writer) = guard.as_mut() {
                let written = serde_json::to_string(&record)
                    .map_err(io::Error::from)
                    .and_then(|json| {
                        writeln!(writer, "{json}")?;
                        writer.flush()
                    });
                if let Err(err) = written {
                    warn!("failed to persist completion of {}: {err}", record.job);
                }
            }
        }

        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }

    pub fn records(&self) -> Vec<CompletedRecord> {
        self.records
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HistoryStats {
        let Ok(records) = self.records.lock() else {
            return HistoryStats::default();
        };
        let mut stats = HistoryStats {
            total: records.len(),
            ..HistoryStats::default()
        };
        for record in records.iter() {
            *stats
                .per_collection
                .entry(record.job.collection.clone())
                .or_insert(0) += 1;
            stats.last_completed_at = stats.last_completed_at.max(Some(record.completed_at));
        }
        stats
    }
}

impl Default for CompletionHistory {
    fn default() -> Self {
        Self::in_memory()
    }
}
