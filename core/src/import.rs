//! Import of chapter archives downloaded by other tools.
//!
//! Files named `<collection>-chapter-<n>.zip` are copied into the library as
//! `<root>/<collection>/<n>.zip`, after which they are ordinary downloaded
//! chapters.

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::job::{is_valid_collection_id, ChapterNumber, ChapterRef, CollectionRef, Task};
use crate::layout::LibraryLayout;

static LOCAL_ARCHIVE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(.+)-chapter-(\d+(?:\.\d+)?)\.zip$").expect("valid archive name regex")
});

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalArchive {
    pub path: PathBuf,
    pub collection: String,
    pub number: ChapterNumber,
}

impl LocalArchive {
    pub fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let captures = LOCAL_ARCHIVE_NAME.captures(name)?;
        let collection = &captures[1];
        if !is_valid_collection_id(collection) {
            return None;
        }
        let number = captures[2].parse::<ChapterNumber>().ok()?;
        Some(Self {
            path: path.to_path_buf(),
            collection: collection.to_string(),
            number,
        })
    }

    pub fn task(&self) -> Task {
        Task::new(
            ChapterRef::new(self.number),
            CollectionRef::new(self.collection.clone()),
        )
    }
}

/// Archives in `dir` that follow the import naming, ordered by collection
/// and chapter number. Other files are ignored.
pub fn scan_local_archives(dir: &Path) -> Result<Vec<LocalArchive>, ImportError> {
    if !dir.is_dir() {
        return Err(ImportError::NotADirectory(dir.to_path_buf()));
    }

    let mut archives = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        match LocalArchive::parse(&entry.path()) {
            Some(archive) => archives.push(archive),
            None => debug!("not an importable archive: {}", entry.path().display()),
        }
    }

    archives.sort_by(|a, b| {
        a.collection
            .cmp(&b.collection)
            .then(a.number.value().total_cmp(&b.number.value()))
    });
    Ok(archives)
}

/// Copies each archive to its canonical place in the library and returns
/// the tasks that now have a download on disk. An archive already present
/// in the library is left untouched.
pub fn import_local_archives(
    layout: &LibraryLayout,
    archives: &[LocalArchive],
) -> Result<Vec<Task>, ImportError> {
    let mut tasks = Vec::with_capacity(archives.len());
    for archive in archives {
        let task = archive.task();
        let target = layout.archive_path(&task.id());

        if target.exists() {
            debug!("{} already in library", target.display());
        } else {
            fs::create_dir_all(layout.collection_dir(&archive.collection))?;
            let staging = target.with_extension("zip.tmp");
            fs::copy(&archive.path, &staging)?;
            fs::rename(&staging, &target)?;
            info!("imported {} as {}", archive.path.display(), task.id());
        }
        tasks.push(task);
    }
    Ok(tasks)
}
