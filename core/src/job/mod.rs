//! Job identity, queued tasks and the snapshots published to observers.

pub mod runner;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Chapter number. Fractional numbering (`10.5`) is allowed, so the value is
/// an `f64` compared bitwise to make it usable as a dedup key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChapterNumber(f64);

impl ChapterNumber {
    /// Unchecked. Parsing rejects what [`ChapterNumber::is_valid`] rejects;
    /// values built here are checked by [`JobId::validate`] before any path
    /// is derived from them.
    pub fn new(value: f64) -> Self {
        // -0.0 and 0.0 must name the same directory
        if value == 0.0 {
            Self(0.0)
        } else {
            Self(value)
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Finite and not negative.
    pub fn is_valid(&self) -> bool {
        self.0.is_finite() && !self.0.is_sign_negative()
    }
}

impl PartialEq for ChapterNumber {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for ChapterNumber {}

impl Hash for ChapterNumber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Display for ChapterNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.fract() == 0.0 && self.0.is_finite() {
            write!(f, "{:.0}", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for ChapterNumber {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parsed = value
            .trim()
            .parse::<f64>()
            .map_err(|err| format!("invalid chapter number '{value}': {err}"))?;
        let number = Self::new(parsed);
        if !number.is_valid() {
            return Err(format!("invalid chapter number '{value}'"));
        }
        Ok(number)
    }
}

impl From<f64> for ChapterNumber {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

/// A collection id names one directory under the library root, so it must be
/// a single plain path segment.
pub fn is_valid_collection_id(id: &str) -> bool {
    !id.trim().is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', ':', '\0'])
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidJob {
    #[error("collection id {0:?} is not a single path segment")]
    CollectionId(String),
    #[error("chapter number {0} is not a finite, non-negative number")]
    ChapterNumber(f64),
}

/// Identity of one unit of work. Used as the only deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobId {
    pub collection: String,
    pub number: ChapterNumber,
}

impl JobId {
    pub fn new(collection: impl Into<String>, number: impl Into<ChapterNumber>) -> Self {
        Self {
            collection: collection.into(),
            number: number.into(),
        }
    }

    /// Checked before anything is read from or written to the library.
    pub fn validate(&self) -> Result<(), InvalidJob> {
        if !is_valid_collection_id(&self.collection) {
            return Err(InvalidJob::CollectionId(self.collection.clone()));
        }
        if !self.number.is_valid() {
            return Err(InvalidJob::ChapterNumber(self.number.value()));
        }
        Ok(())
    }

    /// File stem shared by the archive, raw and translated directories.
    pub fn item_stem(&self) -> String {
        self.number.to_string()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.collection, self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterRef {
    pub number: ChapterNumber,
    #[serde(default)]
    pub title: String,
    /// Reader page of the chapter; source for the page-image fallback.
    #[serde(default)]
    pub url: String,
    /// Direct archive link, when the site offers one.
    #[serde(default)]
    pub download_url: Option<String>,
}

impl ChapterRef {
    pub fn new(number: impl Into<ChapterNumber>) -> Self {
        let number = number.into();
        Self {
            number,
            title: format!("Chapter {number}"),
            url: String::new(),
            download_url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.download_url = if url.trim().is_empty() {
            None
        } else {
            Some(url)
        };
        self
    }

    pub fn direct_url(&self) -> Option<&str> {
        self.download_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRef {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

impl CollectionRef {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            url: String::new(),
        }
    }

    /// Derives the collection id from the last path segment of its URL.
    pub fn from_url(url: &str) -> Option<Self> {
        let id = url
            .trim()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|segment| is_valid_collection_id(segment))?;
        Some(Self {
            id: id.to_string(),
            title: id.to_string(),
            url: url.trim().to_string(),
        })
    }
}

/// A queued unit of work. The same shape travels through the download queue
/// and then the translate queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub chapter: ChapterRef,
    pub collection: CollectionRef,
}

impl Task {
    pub fn new(chapter: ChapterRef, collection: CollectionRef) -> Self {
        Self {
            chapter,
            collection,
        }
    }

    pub fn id(&self) -> JobId {
        JobId::new(self.collection.id.clone(), self.chapter.number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Translate,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Translate => "translate",
        }
    }
}

/// Snapshot of one queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// Task the worker is running, if any.
    pub current_task: Option<Task>,
    /// Progress of the current task, 0 to 100.
    pub current_progress: f32,
    /// Pending tasks plus the running one.
    pub tasks_remaining: usize,
    /// Pending tasks in the order they will run.
    pub queued_tasks: Vec<Task>,
}

impl QueueStatus {
    pub fn is_idle(&self) -> bool {
        self.current_task.is_none() && self.queued_tasks.is_empty()
    }
}

/// Snapshot of both queues, taken under one lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub download: QueueStatus,
    pub translate: QueueStatus,
    pub completed_count: usize,
}

impl PipelineStatus {
    pub fn queue(&self, stage: Stage) -> &QueueStatus {
        match stage {
            Stage::Download => &self.download,
            Stage::Translate => &self.translate,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.download.is_idle() && self.translate.is_idle()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedRecord {
    pub job: JobId,
    pub completed_at: DateTime<Utc>,
    /// The `<item>_translated` directory that passed verification.
    pub output_path: PathBuf,
}

/// Failure classes shared by every stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    Validation,
    Extraction,
    ExternalProcess,
    IncompleteOutput,
    EmptyInput,
    Io,
    /// The job's task panicked or was aborted.
    Internal,
}
