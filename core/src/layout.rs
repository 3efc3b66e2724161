//! On-disk naming contract shared by the pipeline and the reader.
//!
//! ```text
//! <root>/<collection>/<item>.zip
//! <root>/<collection>/<item>/
//! <root>/<collection>/<item>_translated/
//! ```

use crate::job::JobId;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Extensions counted as pages, before and after translation.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Archives may also carry these; they are converted during extraction.
pub const CONVERTIBLE_EXTENSIONS: &[&str] = &["webp"];

const TRANSLATED_SUFFIX: &str = "_translated";
const SCRATCH_SUFFIX: &str = ".pages";

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

pub fn is_recognized_image(path: &Path) -> bool {
    extension_of(path)
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

pub fn is_convertible_image(path: &Path) -> bool {
    extension_of(path)
        .map(|ext| CONVERTIBLE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Recognized images directly inside `dir`, sorted by file name.
pub fn list_images(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && is_recognized_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

pub fn count_images(dir: &Path) -> io::Result<usize> {
    Ok(list_images(dir)?.len())
}

pub fn is_non_empty_dir(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Removes `dir` with everything in it and creates it again.
pub fn reset_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    fs::create_dir_all(dir)
}

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[derive(Debug, Clone)]
pub struct LibraryLayout {
    root: PathBuf,
}

impl LibraryLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collection_dir(&self, collection: &str) -> PathBuf {
        self.root.join(collection)
    }

    pub fn archive_path(&self, job: &JobId) -> PathBuf {
        self.collection_dir(&job.collection)
            .join(format!("{}.zip", job.item_stem()))
    }

    pub fn raw_dir(&self, job: &JobId) -> PathBuf {
        self.collection_dir(&job.collection).join(job.item_stem())
    }

    pub fn translated_dir(&self, job: &JobId) -> PathBuf {
        self.collection_dir(&job.collection)
            .join(format!("{}{TRANSLATED_SUFFIX}", job.item_stem()))
    }

    /// Scratch space for pages fetched one by one before they are packed.
    pub fn scratch_dir(&self, job: &JobId) -> PathBuf {
        self.collection_dir(&job.collection)
            .join(format!(".{}{SCRATCH_SUFFIX}", job.item_stem()))
    }
}
