use serde::Serialize;
use std::path::PathBuf;

use crate::job::{ErrorKind, JobId};

/// Per-job outcomes broadcast to observers. Queue state is published
/// separately as [`crate::job::PipelineStatus`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PipelineEvent {
    DownloadCompleted {
        job: JobId,
        path: PathBuf,
    },
    DownloadFailed {
        job: JobId,
        kind: ErrorKind,
        message: String,
    },
    TranslationCompleted {
        job: JobId,
        path: PathBuf,
    },
    TranslationFailed {
        job: JobId,
        kind: ErrorKind,
        message: String,
    },
}

impl PipelineEvent {
    pub fn job(&self) -> &JobId {
        match self {
            PipelineEvent::DownloadCompleted { job, .. }
            | PipelineEvent::DownloadFailed { job, .. }
            | PipelineEvent::TranslationCompleted { job, .. }
            | PipelineEvent::TranslationFailed { job, .. } => job,
        }
    }
}
