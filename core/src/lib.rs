pub mod archive;
pub mod config;
pub mod detector;
pub mod engine;
pub mod events;
pub mod fetcher;
pub mod history;
pub mod imaging;
pub mod import;
pub mod job;
pub mod layout;
pub mod pipeline;
pub mod progress;
pub mod retry;

pub use archive::{
    extract_pages, pack_pages, scan_archive, validate_archive, ArchiveEntry, ArchiveError,
    ArchiveScanResult,
};
pub use config::{
    default_config_path, ConfigError, DownloadOptions, EngineOptions, PipelineConfig,
    TargetLanguage, TranslatorBackend, TranslatorSettings, UpscaleRatio,
};
pub use detector::{CollectionSummary, WorkDetector};
pub use engine::{CommandEngine, EngineError, EngineOutput, TranslationEngine, TranslationRequest};
pub use events::PipelineEvent;
pub use fetcher::{ArchiveFetcher, ArchiveSource, DownloadError, PageParser, ParserError};
pub use history::{CompletionHistory, HistoryStats};
pub use import::{import_local_archives, scan_local_archives, ImportError, LocalArchive};
pub use job::runner::{TranslateError, TranslationRunner};
pub use job::{
    is_valid_collection_id, ChapterNumber, ChapterRef, CollectionRef, CompletedRecord, ErrorKind,
    InvalidJob, JobId, PipelineStatus, QueueStatus, Stage, Task,
};
pub use layout::LibraryLayout;
pub use pipeline::{PipelineComponents, PipelineCoordinator, PipelineError, SubmitOutcome};
pub use progress::{ProgressEstimator, ProgressHandle, ProgressSink};
pub use retry::{RetryDecision, RetryPolicy};
