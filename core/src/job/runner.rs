use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;

use crate::archive;
use crate::config::TranslatorSettings;
use crate::engine::{EngineError, TranslationEngine, TranslationRequest};
use crate::fetcher::{ArchiveSource, DownloadError};
use crate::history::CompletionHistory;
use crate::job::{CompletedRecord, ErrorKind, InvalidJob, Task};
use crate::layout::{
    count_images, is_non_empty_dir, remove_file_if_exists, reset_dir, LibraryLayout,
};
use crate::progress::{noop_sink, ProgressEstimator, ProgressSink, DEFAULT_POLL_INTERVAL};

/// Extraction attempts per job, the first one included.
pub const EXTRACTION_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("archive could not be fetched: {0}")]
    Download(#[from] DownloadError),
    #[error("extraction failed after {attempts} attempt(s): {message}")]
    Extraction { attempts: u32, message: String },
    #[error("no page images in {0}")]
    EmptyInput(PathBuf),
    #[error("translator could not run: {0}")]
    ExternalProcess(#[from] EngineError),
    #[error("translator produced {actual} of {expected} pages")]
    IncompleteOutput { expected: usize, actual: usize },
    #[error("invalid job: {0}")]
    InvalidJob(#[from] InvalidJob),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranslateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TranslateError::Download(err) => err.kind(),
            TranslateError::Extraction { .. } => ErrorKind::Extraction,
            TranslateError::EmptyInput(_) => ErrorKind::EmptyInput,
            TranslateError::ExternalProcess(_) => ErrorKind::ExternalProcess,
            TranslateError::IncompleteOutput { .. } => ErrorKind::IncompleteOutput,
            TranslateError::InvalidJob(_) => ErrorKind::Validation,
            TranslateError::Io(_) => ErrorKind::Io,
        }
    }
}

/// Takes one downloaded chapter through extraction, the external translator
/// and output verification.
pub struct TranslationRunner {
    layout: LibraryLayout,
    source: Arc<dyn ArchiveSource>,
    engine: Arc<dyn TranslationEngine>,
    history: Arc<CompletionHistory>,
    poll_interval: Duration,
}

impl TranslationRunner {
    pub fn new(
        layout: LibraryLayout,
        source: Arc<dyn ArchiveSource>,
        engine: Arc<dyn TranslationEngine>,
        history: Arc<CompletionHistory>,
    ) -> Self {
        Self {
            layout,
            source,
            engine,
            history,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn history(&self) -> &Arc<CompletionHistory> {
        &self.history
    }

    pub async fn run(
        &self,
        task: &Task,
        settings: &TranslatorSettings,
        progress: ProgressSink,
    ) -> Result<PathBuf, TranslateError> {
        let job = task.id();
        job.validate()?;
        let raw_dir = self.layout.raw_dir(&job);
        if !is_non_empty_dir(&raw_dir) {
            self.prepare_raw_pages(task).await?;
        }

        let expected = count_images(&raw_dir)?;
        if expected == 0 {
            return Err(TranslateError::EmptyInput(raw_dir));
        }

        let output_dir = self.layout.translated_dir(&job);
        reset_dir(&output_dir)?;
        progress(0.0);

        let estimator = ProgressEstimator::new(&output_dir, expected)
            .with_interval(self.poll_interval)
            .spawn(progress);
        let request = TranslationRequest {
            input_dir: raw_dir,
            output_dir: output_dir.clone(),
            settings: settings.clone(),
        };
        let outcome = self.engine.translate(&request).await;
        estimator.stop().await;

        let output = outcome?;
        if !output.success {
            warn!(
                "translator exited with {:?} for {job}; checking its output",
                output.exit_code
            );
        }

        let actual = translated_pages(&output_dir)?;
        if actual != expected {
            return Err(TranslateError::IncompleteOutput { expected, actual });
        }

        self.history.append(CompletedRecord {
            job: job.clone(),
            completed_at: Utc::now(),
            output_path: output_dir.clone(),
        });
        info!("translated {job}: {actual} page(s)");
        Ok(output_dir)
    }

    /// Extracts the archive into the raw directory, fetching the archive
    /// again after every failed attempt but the last.
    async fn prepare_raw_pages(&self, task: &Task) -> Result<(), TranslateError> {
        let job = task.id();
        let archive_path = self.layout.archive_path(&job);
        let raw_dir = self.layout.raw_dir(&job);

        if !archive_path.is_file() {
            debug!("{job} has no archive yet; fetching it");
            self.source.fetch(task, noop_sink()).await?;
        }

        let mut last_error = String::new();
        for attempt in 1..=EXTRACTION_ATTEMPTS {
            match extract(&archive_path, &raw_dir).await {
                Ok(pages) => {
                    debug!("extracted {pages} page(s) for {job} on attempt {attempt}");
                    return Ok(());
                }
                Err(message) => {
                    warn!(
                        "extraction attempt {attempt}/{EXTRACTION_ATTEMPTS} for {job} failed: {message}"
                    );
                    last_error = message;
                }
            }

            if raw_dir.exists() {
                std::fs::remove_dir_all(&raw_dir)?;
            }
            remove_file_if_exists(&archive_path)?;

            if attempt < EXTRACTION_ATTEMPTS {
                self.source.fetch(task, noop_sink()).await?;
            }
        }

        Err(TranslateError::Extraction {
            attempts: EXTRACTION_ATTEMPTS,
            message: last_error,
        })
    }
}

async fn extract(archive_path: &Path, raw_dir: &Path) -> Result<usize, String> {
    let archive_path = archive_path.to_path_buf();
    let raw_dir = raw_dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> archive::ArchiveResult<usize> {
        reset_dir(&raw_dir)?;
        archive::extract_pages(&archive_path, &raw_dir)
    })
    .await
    .map_err(|err| err.to_string())?
    .map_err(|err| err.to_string())
}

fn translated_pages(output_dir: &Path) -> std::io::Result<usize> {
    match count_images(output_dir) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        other => other,
    }
}
