use crate::job::{ChapterRef, JobId};
use crate::layout::{count_images, is_non_empty_dir, LibraryLayout};
use log::debug;
use serde::Serialize;

/// Answers "is there anything left to do for this job" from what is on disk.
///
/// Reads take no lock. A job that is being written right now may read as not
/// done yet, which at worst causes a redundant submission.
#[derive(Debug, Clone)]
pub struct WorkDetector {
    layout: LibraryLayout,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSummary {
    /// Chapters listed for the collection.
    pub total: usize,
    /// Chapters with an archive or extracted pages on disk.
    pub downloaded: usize,
    /// Chapters whose translated output is complete.
    pub translated: usize,
}

impl WorkDetector {
    pub fn new(layout: LibraryLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &LibraryLayout {
        &self.layout
    }

    pub fn is_downloaded(&self, job: &JobId) -> bool {
        self.layout.archive_path(job).is_file() || is_non_empty_dir(&self.layout.raw_dir(job))
    }

    /// Partial output counts as not translated, so the job is redone in full.
    pub fn is_translated(&self, job: &JobId) -> bool {
        let raw_dir = self.layout.raw_dir(job);
        let translated_dir = self.layout.translated_dir(job);
        if !raw_dir.is_dir() || !translated_dir.is_dir() {
            return false;
        }

        let (raw, translated) = match (count_images(&raw_dir), count_images(&translated_dir)) {
            (Ok(raw), Ok(translated)) => (raw, translated),
            (Err(err), _) | (_, Err(err)) => {
                debug!("treating {job} as not translated: {err}");
                return false;
            }
        };

        translated > 0 && translated == raw
    }

    pub fn summarize(&self, collection: &str, chapters: &[ChapterRef]) -> CollectionSummary {
        let mut summary = CollectionSummary {
            total: chapters.len(),
            ..CollectionSummary::default()
        };
        for chapter in chapters {
            let job = JobId::new(collection, chapter.number);
            if job.validate().is_err() {
                continue;
            }
            if self.is_downloaded(&job) {
                summary.downloaded += 1;
            }
            if self.is_translated(&job) {
                summary.translated += 1;
            }
        }
        summary
    }
}
