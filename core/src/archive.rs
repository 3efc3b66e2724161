//! Chapter archive handling.
//!
//! Validates downloaded zips, extracts their pages into the raw directory and
//! packs individually fetched pages back into the canonical archive.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use zip::read::ZipArchive;
use zip::write::{FileOptions, ZipWriter};
use zip::CompressionMethod;

use crate::imaging;
use crate::layout::{is_convertible_image, is_recognized_image};

/// Largest page accepted from an archive, compressed or not.
pub const MAX_PAGE_BYTES: u64 = 64 << 20;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Archive not found: {0}")]
    NotFound(String),

    #[error("Archive contains no page images ({0} entries)")]
    NoImages(usize),

    #[error("Page {entry} exceeds the 64 MiB page limit")]
    EntryTooLarge { entry: String },

    #[error("Page {entry} could not be converted: {message}")]
    Conversion { entry: String, message: String },
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// A page image inside a chapter archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Path of the entry inside the zip, folders included.
    pub path: String,
    /// Uncompressed size as declared by the zip header.
    pub size: u64,
    /// Compressed size in bytes.
    pub compressed_size: u64,
}

/// Page images found in one archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveScanResult {
    /// Archive that was scanned.
    pub archive_path: PathBuf,
    /// Entries recognized as pages, in archive order.
    pub image_entries: Vec<ArchiveEntry>,
    /// Number of entries of any kind, directories included.
    pub total_entries: usize,
}

fn is_page_entry(entry_path: &str) -> bool {
    let path = Path::new(entry_path);
    let hidden = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(true);
    // macOS resource forks look like images but are not
    let resource_fork = entry_path.starts_with("__MACOSX/") || entry_path.contains("/__MACOSX/");
    !hidden && !resource_fork && (is_recognized_image(path) || is_convertible_image(path))
}

pub fn scan_archive(archive_path: &Path) -> ArchiveResult<ArchiveScanResult> {
    if !archive_path.exists() {
        return Err(ArchiveError::NotFound(archive_path.display().to_string()));
    }

    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;

    let total_entries = archive.len();
    let mut image_entries = Vec::new();

    for i in 0..total_entries {
        let entry = archive.by_index(i)?;
        if entry.is_dir() || !is_page_entry(entry.name()) {
            continue;
        }

        image_entries.push(ArchiveEntry {
            path: entry.name().to_string(),
            size: entry.size(),
            compressed_size: entry.compressed_size(),
        });
    }

    Ok(ArchiveScanResult {
        archive_path: archive_path.to_path_buf(),
        image_entries,
        total_entries,
    })
}

/// Opens the archive and requires at least one page image in it.
pub fn validate_archive(archive_path: &Path) -> ArchiveResult<usize> {
    let scan = scan_archive(archive_path)?;
    if scan.image_entries.is_empty() {
        return Err(ArchiveError::NoImages(scan.total_entries));
    }
    Ok(scan.image_entries.len())
}

/// Writes every page of the archive directly into `target_dir`.
///
/// Nested folders inside the archive are flattened; `.webp` pages are
/// converted to `.jpg`. Returns the number of pages written.
pub fn extract_pages(archive_path: &Path, target_dir: &Path) -> ArchiveResult<usize> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    fs::create_dir_all(target_dir)?;

    let mut written = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() || !is_page_entry(entry.name()) {
            continue;
        }

        let entry_name = entry.name().to_string();
        let Some(file_name) = entry
            .enclosed_name()
            .and_then(|path| path.file_name().map(|name| name.to_os_string()))
        else {
            debug!("skipping unsafe archive entry {entry_name}");
            continue;
        };

        // the declared size comes from the download and is only a hint
        if entry.size() > MAX_PAGE_BYTES {
            return Err(ArchiveError::EntryTooLarge { entry: entry_name });
        }
        let mut contents = Vec::with_capacity(entry.size() as usize);
        (&mut entry)
            .take(MAX_PAGE_BYTES + 1)
            .read_to_end(&mut contents)?;
        if contents.len() as u64 > MAX_PAGE_BYTES {
            return Err(ArchiveError::EntryTooLarge { entry: entry_name });
        }

        let mut output_path = target_dir.join(&file_name);
        if is_convertible_image(&output_path) {
            contents = imaging::normalize_to_jpeg(&contents).map_err(|err| {
                ArchiveError::Conversion {
                    entry: entry_name.clone(),
                    message: err.to_string(),
                }
            })?;
            output_path.set_extension("jpg");
        }

        if output_path.exists() {
            // two folders in the archive used the same page name
            let original = output_path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            output_path = target_dir.join(format!("{i:04}_{original}"));
        }

        fs::write(&output_path, &contents)?;
        written += 1;
    }

    Ok(written)
}

/// Packs `pages` into a new archive at `output_path`, replacing any previous
/// file only once the new one is complete.
pub fn pack_pages(pages: &[PathBuf], output_path: &Path) -> ArchiveResult<()> {
    let output_dir = output_path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(output_dir)?;

    let temp_path = output_path.with_extension("zip.tmp");
    let output_file = File::create(&temp_path)?;
    let mut writer = ZipWriter::new(output_file);

    let options = FileOptions::<()>::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for page in pages {
        let name = page
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| ArchiveError::NotFound(page.display().to_string()))?;
        let contents = fs::read(page)?;
        writer.start_file(name, options.clone())?;
        writer.write_all(&contents)?;
    }

    writer.finish()?;
    fs::rename(&temp_path, output_path)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    pub fn encoded_image(format: ImageFormat) -> Vec<u8> {
        let image = RgbaImage::from_pixel(3, 3, Rgba([40, 80, 120, 255]));
        let image = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(image).to_rgb8()),
            _ => DynamicImage::ImageRgba8(image),
        };
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, format).unwrap();
        buffer.into_inner()
    }

    pub fn zip_bytes(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in entries {
            writer
                .start_file(*name, FileOptions::<()>::default())
                .unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }
}
