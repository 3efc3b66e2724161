//! Chapter downloads.
//!
//! A chapter arrives either as a direct archive link or, when that link is
//! missing or serves something that is not a page archive, as a list of page
//! images discovered by a [`PageParser`]. Either way the result is the
//! canonical `<root>/<collection>/<item>.zip`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::archive::{self, ArchiveError};
use crate::config::DownloadOptions;
use crate::imaging::{normalize_to_jpeg, page_file_name};
use crate::job::{ChapterRef, ErrorKind, InvalidJob, Task};
use crate::layout::LibraryLayout;
use crate::progress::{percentage, ProgressSink};
use crate::retry::{evaluate_retry, parse_retry_after, RetryError, RetryPolicy};

const USER_AGENT: &str = concat!("chapter-translator/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected page structure: {0}")]
    Structure(String),
}

/// Site-specific discovery of chapters and page images.
#[async_trait]
pub trait PageParser: Send + Sync {
    /// Chapters of a collection, in reading order.
    async fn list_chapters(&self, collection_url: &str) -> Result<Vec<ChapterRef>, ParserError>;

    /// Page image URLs of one chapter, in reading order.
    async fn chapter_images(&self, chapter_url: &str) -> Result<Vec<String>, ParserError>;
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server answered {status} for {url}")]
    Http {
        status: StatusCode,
        url: String,
        retry_after: Option<Duration>,
    },
    #[error("downloaded archive rejected: {0}")]
    Validation(#[from] ArchiveError),
    #[error("no page image could be downloaded for {0}")]
    NoImages(String),
    #[error("page parser failed: {0}")]
    Parser(#[from] ParserError),
    #[error("{0} has neither a download link nor a chapter page")]
    NoSource(String),
    #[error("invalid job: {0}")]
    InvalidJob(#[from] InvalidJob),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::Network(_) | DownloadError::Http { .. } | DownloadError::Parser(_) => {
                ErrorKind::Network
            }
            DownloadError::Validation(ArchiveError::Io(_)) | DownloadError::Io(_) => ErrorKind::Io,
            DownloadError::Validation(_)
            | DownloadError::NoImages(_)
            | DownloadError::NoSource(_)
            | DownloadError::InvalidJob(_) => ErrorKind::Validation,
        }
    }

    fn retry_class(&self) -> RetryError {
        match self {
            DownloadError::Http {
                status,
                retry_after,
                ..
            } => RetryError::Http {
                status: *status,
                retry_after: *retry_after,
            },
            DownloadError::Network(err) if err.is_builder() => RetryError::Fatal,
            DownloadError::Network(_) => RetryError::Network,
            _ => RetryError::Fatal,
        }
    }
}

fn blocking_failure(err: tokio::task::JoinError) -> DownloadError {
    DownloadError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
}

/// Produces the archive of a task. The translation runner only depends on
/// this seam, so a re-fetch can be driven without the network in tests.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    async fn fetch(&self, task: &Task, progress: ProgressSink) -> Result<PathBuf, DownloadError>;
}

pub struct ArchiveFetcher {
    client: Client,
    layout: LibraryLayout,
    parser: Arc<dyn PageParser>,
    policy: RetryPolicy,
    request_timeout: Duration,
}

impl ArchiveFetcher {
    pub fn new(
        layout: LibraryLayout,
        parser: Arc<dyn PageParser>,
        options: &DownloadOptions,
    ) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(options.request_timeout())
            .build()?;

        Ok(Self {
            client,
            layout,
            parser,
            policy: options.retry_policy(),
            request_timeout: options.request_timeout(),
        })
    }

    pub fn layout(&self) -> &LibraryLayout {
        &self.layout
    }

    /// Runs `operation` until it succeeds or the retry policy gives up.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, DownloadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
    {
        let mut retries = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let decision = evaluate_retry(err.retry_class(), self.policy, retries);
                    if !decision.should_retry {
                        return Err(err);
                    }
                    retries += 1;
                    warn!(
                        "{what} failed ({err}); retry {retries}/{} in {}ms{}",
                        self.policy.max_retries,
                        decision.delay_ms,
                        if decision.used_hint {
                            " (server hint)"
                        } else {
                            ""
                        }
                    );
                    tokio::time::sleep(decision.delay()).await;
                }
            }
        }
    }

    async fn download_direct(
        &self,
        url: &str,
        archive_path: &Path,
        progress: &ProgressSink,
    ) -> Result<(), DownloadError> {
        let part_path = archive_path.with_extension("zip.part");

        let streamed = self
            .with_retries(url, || self.stream_to_file(url, &part_path, progress))
            .await;
        if let Err(err) = streamed {
            discard(&part_path).await;
            return Err(err);
        }

        let candidate = part_path.clone();
        let validated = tokio::task::spawn_blocking(move || archive::validate_archive(&candidate))
            .await
            .map_err(blocking_failure)?;
        match validated {
            Ok(pages) => {
                tokio::fs::rename(&part_path, archive_path).await?;
                debug!("{} holds {pages} page(s)", archive_path.display());
                Ok(())
            }
            Err(err) => {
                discard(&part_path).await;
                Err(err.into())
            }
        }
    }

    async fn stream_to_file(
        &self,
        url: &str,
        target: &Path,
        progress: &ProgressSink,
    ) -> Result<(), DownloadError> {
        let mut response = self.client.get(url).send().await?;
        check_status(&response, url)?;

        let total = response.content_length().filter(|length| *length > 0);
        let mut file = tokio::fs::File::create(target).await?;
        let mut received: u64 = 0;

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(total) = total {
                progress(percentage(received as usize, total as usize));
            }
        }
        file.flush().await?;
        Ok(())
    }

    async fn fetch_page(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        check_status(&response, url)?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn download_pages(
        &self,
        task: &Task,
        archive_path: &Path,
        progress: &ProgressSink,
    ) -> Result<(), DownloadError> {
        let job = task.id();
        let chapter_url = task.chapter.url.trim();
        if chapter_url.is_empty() {
            return Err(DownloadError::NoSource(job.to_string()));
        }

        let image_urls = self.parser.chapter_images(chapter_url).await?;
        if image_urls.is_empty() {
            return Err(DownloadError::NoImages(chapter_url.to_string()));
        }

        let scratch = self.layout.scratch_dir(&job);
        if tokio::fs::metadata(&scratch).await.is_ok() {
            tokio::fs::remove_dir_all(&scratch).await?;
        }
        tokio::fs::create_dir_all(&scratch).await?;

        let total = image_urls.len();
        let mut pages = Vec::with_capacity(total);
        for (index, url) in image_urls.iter().enumerate() {
            match self.download_page(url, &scratch.join(page_file_name(index))).await {
                Ok(page) => pages.push(page),
                Err(err) => warn!("skipping page {} of {job}: {err}", index + 1),
            }
            progress(percentage(index + 1, total));
        }

        if pages.is_empty() {
            let _ = tokio::fs::remove_dir_all(&scratch).await;
            return Err(DownloadError::NoImages(chapter_url.to_string()));
        }
        if pages.len() < total {
            warn!("{job}: packed {} of {total} pages", pages.len());
        }

        let output = archive_path.to_path_buf();
        let packed = tokio::task::spawn_blocking(move || archive::pack_pages(&pages, &output))
            .await
            .map_err(blocking_failure)?;
        if let Err(err) = tokio::fs::remove_dir_all(&scratch).await {
            debug!("could not remove {}: {err}", scratch.display());
        }
        packed?;
        Ok(())
    }

    async fn download_page(&self, url: &str, target: &Path) -> Result<PathBuf, DownloadError> {
        let bytes = self.with_retries(url, || self.fetch_page(url)).await?;
        let jpeg = tokio::task::spawn_blocking(move || normalize_to_jpeg(&bytes))
            .await
            .map_err(blocking_failure)?
            .map_err(|err| {
                DownloadError::Validation(ArchiveError::Conversion {
                    entry: url.to_string(),
                    message: err.to_string(),
                })
            })?;
        tokio::fs::write(target, jpeg).await?;
        Ok(target.to_path_buf())
    }
}

#[async_trait]
impl ArchiveSource for ArchiveFetcher {
    async fn fetch(&self, task: &Task, progress: ProgressSink) -> Result<PathBuf, DownloadError> {
        let job = task.id();
        job.validate()?;
        let archive_path = self.layout.archive_path(&job);
        tokio::fs::create_dir_all(self.layout.collection_dir(&job.collection)).await?;

        if let Some(url) = task.chapter.direct_url() {
            match self.download_direct(url, &archive_path, &progress).await {
                Ok(()) => {
                    info!("downloaded {job} from {url}");
                    return Ok(archive_path);
                }
                Err(err) if task.chapter.url.trim().is_empty() => return Err(err),
                Err(err) => {
                    warn!("direct download of {job} failed ({err}); using page images")
                }
            }
        }

        self.download_pages(task, &archive_path, &progress).await?;
        info!("downloaded {job} page by page");
        Ok(archive_path)
    }
}

fn check_status(response: &reqwest::Response, url: &str) -> Result<(), DownloadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_retry_after(value, SystemTime::now()));
    Err(DownloadError::Http {
        status,
        url: url.to_string(),
        retry_after,
    })
}

async fn discard(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("could not remove {}: {err}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::{encoded_image, zip_bytes};
    use crate::job::CollectionRef;
    use crate::progress::noop_sink;
    use image::ImageFormat;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct StaticParser {
        images: HashMap<String, Vec<String>>,
        requested: Mutex<Vec<String>>,
    }

    impl StaticParser {
        fn with_images(chapter_url: &str, images: Vec<String>) -> Self {
            let mut parser = Self::default();
            parser.images.insert(chapter_url.to_string(), images);
            parser
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageParser for StaticParser {
        async fn list_chapters(&self, _: &str) -> Result<Vec<ChapterRef>, ParserError> {
            Ok(Vec::new())
        }

        async fn chapter_images(&self, chapter_url: &str) -> Result<Vec<String>, ParserError> {
            self.requested.lock().unwrap().push(chapter_url.to_string());
            self.images
                .get(chapter_url)
                .cloned()
                .ok_or_else(|| ParserError::Structure(chapter_url.to_string()))
        }
    }

    fn options() -> DownloadOptions {
        DownloadOptions {
            max_retries: 2,
            base_delay_ms: 0,
            max_delay_ms: 0,
            request_timeout_secs: 5,
        }
    }

    fn task(chapter: ChapterRef) -> Task {
        Task::new(chapter, CollectionRef::new("berserk"))
    }

    async fn mount_page(server: &MockServer, route: &str, format: ImageFormat) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(encoded_image(format)))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn direct_archive_is_downloaded_and_validated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(zip_bytes(&[
                ("001.jpg", encoded_image(ImageFormat::Jpeg)),
                ("002.jpg", encoded_image(ImageFormat::Jpeg)),
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let parser = Arc::new(StaticParser::default());
        let fetcher =
            ArchiveFetcher::new(LibraryLayout::new(dir.path()), parser.clone(), &options()).unwrap();
        let chapter = ChapterRef::new(1.0).with_download_url(format!("{}/1.zip", server.uri()));

        let archive = fetcher.fetch(&task(chapter), noop_sink()).await.unwrap();
        assert_eq!(archive, dir.path().join("berserk").join("1.zip"));
        assert_eq!(archive::validate_archive(&archive).unwrap(), 2);
        assert!(!archive.with_extension("zip.part").exists());
        assert!(parser.requested().is_empty());
    }

    #[tokio::test]
    async fn archive_without_pages_falls_back_to_page_images() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/2.zip"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(zip_bytes(&[("readme.txt", b"nothing here".to_vec())])),
            )
            .expect(1)
            .mount(&server)
            .await;
        mount_page(&server, "/p1.png", ImageFormat::Png).await;
        mount_page(&server, "/p2.webp", ImageFormat::WebP).await;

        let reader = format!("{}/read/2", server.uri());
        let parser = Arc::new(StaticParser::with_images(
            &reader,
            vec![
                format!("{}/p1.png", server.uri()),
                format!("{}/p2.webp", server.uri()),
            ],
        ));
        let dir = tempdir().unwrap();
        let fetcher =
            ArchiveFetcher::new(LibraryLayout::new(dir.path()), parser.clone(), &options()).unwrap();
        let chapter = ChapterRef::new(2.0)
            .with_url(&reader)
            .with_download_url(format!("{}/2.zip", server.uri()));

        let archive = fetcher.fetch(&task(chapter), noop_sink()).await.unwrap();
        assert_eq!(parser.requested(), vec![reader]);

        let scan = archive::scan_archive(&archive).unwrap();
        let names: Vec<_> = scan.image_entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, vec!["001.jpg", "002.jpg"]);
        assert!(!fetcher.layout().scratch_dir(&task(ChapterRef::new(2.0)).id()).exists());
    }

    #[tokio::test]
    async fn server_errors_are_retried_before_falling_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/3.zip"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;
        mount_page(&server, "/p1.jpg", ImageFormat::Jpeg).await;

        let reader = format!("{}/read/3", server.uri());
        let parser = Arc::new(StaticParser::with_images(
            &reader,
            vec![format!("{}/p1.jpg", server.uri())],
        ));
        let dir = tempdir().unwrap();
        let fetcher = ArchiveFetcher::new(LibraryLayout::new(dir.path()), parser, &options()).unwrap();
        let chapter = ChapterRef::new(3.0)
            .with_url(&reader)
            .with_download_url(format!("{}/3.zip", server.uri()));

        let archive = fetcher.fetch(&task(chapter), noop_sink()).await.unwrap();
        assert_eq!(archive::validate_archive(&archive).unwrap(), 1);
    }

    #[tokio::test]
    async fn client_error_without_chapter_page_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/4.zip"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let fetcher = ArchiveFetcher::new(
            LibraryLayout::new(dir.path()),
            Arc::new(StaticParser::default()),
            &options(),
        )
        .unwrap();
        let chapter = ChapterRef::new(4.0).with_download_url(format!("{}/4.zip", server.uri()));

        let err = fetcher.fetch(&task(chapter), noop_sink()).await.unwrap_err();
        assert!(matches!(err, DownloadError::Http { status, .. } if status == StatusCode::NOT_FOUND));
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[tokio::test]
    async fn partial_page_failures_still_produce_an_archive() {
        let server = MockServer::start().await;
        mount_page(&server, "/p1.jpg", ImageFormat::Jpeg).await;
        Mock::given(method("GET"))
            .and(path("/p2.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/p3.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>not a page</html>"))
            .mount(&server)
            .await;
        mount_page(&server, "/p4.png", ImageFormat::Png).await;

        let reader = format!("{}/read/5", server.uri());
        let parser = Arc::new(StaticParser::with_images(
            &reader,
            ["/p1.jpg", "/p2.jpg", "/p3.jpg", "/p4.png"]
                .iter()
                .map(|route| format!("{}{route}", server.uri()))
                .collect(),
        ));
        let dir = tempdir().unwrap();
        let fetcher = ArchiveFetcher::new(LibraryLayout::new(dir.path()), parser, &options()).unwrap();

        let readings = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&readings);
        let sink: ProgressSink = Arc::new(move |value| captured.lock().unwrap().push(value));

        let archive = fetcher
            .fetch(&task(ChapterRef::new(5.0).with_url(&reader)), sink)
            .await
            .unwrap();

        let scan = archive::scan_archive(&archive).unwrap();
        let names: Vec<_> = scan.image_entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, vec!["001.jpg", "004.jpg"]);
        assert_eq!(*readings.lock().unwrap(), vec![25.0, 50.0, 75.0, 100.0]);
    }

    #[tokio::test]
    async fn zero_downloadable_pages_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.jpg"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let reader = format!("{}/read/6", server.uri());
        let parser = Arc::new(StaticParser::with_images(
            &reader,
            vec![format!("{}/gone.jpg", server.uri())],
        ));
        let dir = tempdir().unwrap();
        let layout = LibraryLayout::new(dir.path());
        let fetcher = ArchiveFetcher::new(layout.clone(), parser, &options()).unwrap();
        let task = task(ChapterRef::new(6.0).with_url(&reader));

        let err = fetcher.fetch(&task, noop_sink()).await.unwrap_err();
        assert!(matches!(err, DownloadError::NoImages(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!layout.archive_path(&task.id()).exists());
        assert!(!layout.scratch_dir(&task.id()).exists());
    }

    #[tokio::test]
    async fn chapter_without_any_source_is_rejected() {
        let dir = tempdir().unwrap();
        let fetcher = ArchiveFetcher::new(
            LibraryLayout::new(dir.path()),
            Arc::new(StaticParser::default()),
            &options(),
        )
        .unwrap();

        let err = fetcher
            .fetch(&task(ChapterRef::new(7.0)), noop_sink())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NoSource(_)));
    }

    #[tokio::test]
    async fn collection_outside_the_library_is_rejected() {
        let parent = tempdir().unwrap();
        let library = parent.path().join("library");
        let fetcher = ArchiveFetcher::new(
            LibraryLayout::new(&library),
            Arc::new(StaticParser::default()),
            &options(),
        )
        .unwrap();
        let task = Task::new(
            ChapterRef::new(1.0).with_download_url("http://127.0.0.1:9/1.zip"),
            CollectionRef::new(".."),
        );

        let err = fetcher.fetch(&task, noop_sink()).await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidJob(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!library.exists());
    }
}
