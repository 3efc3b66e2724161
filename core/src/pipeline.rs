//! Download and translate queues.
//!
//! [`PipelineCoordinator`] owns two FIFO queues. Each queue is drained by a
//! single worker task that is spawned on the first enqueue and exits once its
//! queue is empty, so a long translation never holds up downloads and the
//! other way round. A finished download is routed to the translate queue.
//!
//! Observers read the latest [`PipelineStatus`] from a `watch` channel and
//! per-job outcomes from a `broadcast` channel of [`PipelineEvent`]s.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinError;

use crate::config::{PipelineConfig, TranslatorSettings};
use crate::detector::{CollectionSummary, WorkDetector};
use crate::engine::{CommandEngine, TranslationEngine};
use crate::events::PipelineEvent;
use crate::fetcher::{ArchiveFetcher, ArchiveSource, DownloadError, PageParser, ParserError};
use crate::history::{CompletionHistory, HISTORY_FILE_NAME};
use crate::import::{import_local_archives, scan_local_archives, ImportError};
use crate::job::runner::{TranslateError, TranslationRunner};
use crate::job::{
    ChapterRef, CollectionRef, ErrorKind, JobId, PipelineStatus, QueueStatus, Stage, Task,
};
use crate::layout::LibraryLayout;
use crate::progress::ProgressSink;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("downloader unavailable: {0}")]
    Download(#[from] DownloadError),
    #[error("chapter list unavailable: {0}")]
    Parser(#[from] ParserError),
    #[error("import failed: {0}")]
    Import(#[from] ImportError),
    #[error("collection {0} has no URL")]
    MissingCollectionUrl(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SubmitOutcome {
    /// Translated output is already complete on disk.
    AlreadyDone,
    /// The job is already pending or running in one of the queues.
    AlreadyQueued,
    /// The collection id or chapter number cannot name a library path.
    Rejected,
    Queued(Stage),
}

/// Why a job failed, as reported to observers.
struct JobFailure {
    kind: ErrorKind,
    message: String,
}

impl From<DownloadError> for JobFailure {
    fn from(err: DownloadError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<TranslateError> for JobFailure {
    fn from(err: TranslateError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<JoinError> for JobFailure {
    fn from(err: JoinError) -> Self {
        let message = if err.is_panic() {
            format!("job panicked: {}", panic_message(err.into_panic()))
        } else {
            "job was aborted".to_string()
        };
        Self {
            kind: ErrorKind::Internal,
            message,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .unwrap_or_else(|| "unknown panic".to_string()),
    }
}

/// Everything the coordinator drives. Tests swap in their own source,
/// engine and parser.
pub struct PipelineComponents {
    pub layout: LibraryLayout,
    pub parser: Arc<dyn PageParser>,
    pub source: Arc<dyn ArchiveSource>,
    pub engine: Arc<dyn TranslationEngine>,
    pub history: Arc<CompletionHistory>,
    pub settings: TranslatorSettings,
    pub poll_interval: Duration,
}

#[derive(Default)]
struct StageQueue {
    pending: VecDeque<Task>,
    current: Option<Task>,
    progress: f32,
    worker_running: bool,
}

impl StageQueue {
    fn contains(&self, job: &JobId) -> bool {
        self.current.iter().any(|task| &task.id() == job)
            || self.pending.iter().any(|task| &task.id() == job)
    }

    /// Marks the worker as running; true when the caller has to spawn it.
    fn claim_worker(&mut self) -> bool {
        !std::mem::replace(&mut self.worker_running, true)
    }

    fn finish_current(&mut self) {
        self.current = None;
        self.progress = 0.0;
    }

    fn snapshot(&self) -> QueueStatus {
        let queued_tasks: Vec<Task> = self.pending.iter().cloned().collect();
        QueueStatus {
            current_task: self.current.clone(),
            current_progress: self.progress,
            tasks_remaining: queued_tasks.len() + usize::from(self.current.is_some()),
            queued_tasks,
        }
    }
}

#[derive(Default)]
struct QueueState {
    download: StageQueue,
    translate: StageQueue,
    /// Bumped by `cancel_all`; downloads started in an older generation are
    /// not routed to the translate queue.
    generation: u64,
}

impl QueueState {
    fn queue_mut(&mut self, stage: Stage) -> &mut StageQueue {
        match stage {
            Stage::Download => &mut self.download,
            Stage::Translate => &mut self.translate,
        }
    }

    fn contains(&self, job: &JobId) -> bool {
        self.download.contains(job) || self.translate.contains(job)
    }
}

struct Inner {
    detector: WorkDetector,
    parser: Arc<dyn PageParser>,
    source: Arc<dyn ArchiveSource>,
    runner: TranslationRunner,
    settings: RwLock<TranslatorSettings>,
    state: Mutex<QueueState>,
    status_tx: watch::Sender<PipelineStatus>,
    events_tx: broadcast::Sender<PipelineEvent>,
    runtime: Handle,
}

/// Cloneable handle to the queues. All clones drive the same pipeline.
#[derive(Clone)]
pub struct PipelineCoordinator {
    inner: Arc<Inner>,
}

impl PipelineCoordinator {
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; workers are spawned on it.
    pub fn new(components: PipelineComponents) -> Self {
        let PipelineComponents {
            layout,
            parser,
            source,
            engine,
            history,
            settings,
            poll_interval,
        } = components;

        let runner = TranslationRunner::new(layout.clone(), source.clone(), engine, history)
            .with_poll_interval(poll_interval);
        let (status_tx, _) = watch::channel(PipelineStatus {
            completed_count: runner.history().len(),
            ..PipelineStatus::default()
        });
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                detector: WorkDetector::new(layout),
                parser,
                source,
                runner,
                settings: RwLock::new(settings),
                state: Mutex::new(QueueState::default()),
                status_tx,
                events_tx,
                runtime: Handle::current(),
            }),
        }
    }

    /// Wires the HTTP fetcher and the external translator command from
    /// `config`. Chapter discovery stays with the caller's `parser`.
    pub fn from_config(
        config: &PipelineConfig,
        parser: Arc<dyn PageParser>,
    ) -> Result<Self, PipelineError> {
        let layout = LibraryLayout::new(&config.library_root);
        std::fs::create_dir_all(layout.root())?;

        let history = if config.persist_history {
            CompletionHistory::with_file(layout.root().join(HISTORY_FILE_NAME))?
        } else {
            CompletionHistory::in_memory()
        };
        let fetcher = ArchiveFetcher::new(layout.clone(), parser.clone(), &config.download)?;
        info!("library at {}", layout.root().display());
        if let Some(path) = history.path() {
            info!("completion history at {} ({} record(s))", path.display(), history.len());
        }

        Ok(Self::new(PipelineComponents {
            layout,
            parser,
            source: Arc::new(fetcher),
            engine: Arc::new(CommandEngine::from(config.engine.clone())),
            history: Arc::new(history),
            settings: config.translator.clone(),
            poll_interval: config.progress_poll_interval(),
        }))
    }

    pub fn submit(&self, chapter: ChapterRef, collection: CollectionRef) -> SubmitOutcome {
        self.submit_task(Task::new(chapter, collection))
    }

    pub fn submit_task(&self, task: Task) -> SubmitOutcome {
        let job = task.id();
        if let Err(err) = job.validate() {
            warn!("rejected {job}: {err}");
            return SubmitOutcome::Rejected;
        }
        let detector = &self.inner.detector;
        if detector.is_translated(&job) {
            debug!("{job} already translated");
            return SubmitOutcome::AlreadyDone;
        }
        let stage = if detector.is_downloaded(&job) {
            Stage::Translate
        } else {
            Stage::Download
        };

        let spawn = {
            let mut state = self.lock_state();
            if state.contains(&job) {
                debug!("{job} already queued");
                return SubmitOutcome::AlreadyQueued;
            }
            let queue = state.queue_mut(stage);
            queue.pending.push_back(task);
            let spawn = queue.claim_worker();
            self.publish(&state);
            spawn
        };

        info!("queued {job} for {}", stage.label());
        if spawn {
            self.spawn_worker(stage);
        }
        SubmitOutcome::Queued(stage)
    }

    /// Submits every chapter the parser lists for `collection`, lowest
    /// chapter number first.
    pub async fn submit_collection(
        &self,
        collection: CollectionRef,
    ) -> Result<Vec<(JobId, SubmitOutcome)>, PipelineError> {
        if collection.url.trim().is_empty() {
            return Err(PipelineError::MissingCollectionUrl(collection.id));
        }
        let mut chapters = self.inner.parser.list_chapters(&collection.url).await?;
        chapters.sort_by(|a, b| a.number.value().total_cmp(&b.number.value()));

        Ok(chapters
            .into_iter()
            .map(|chapter| {
                let task = Task::new(chapter, collection.clone());
                (task.id(), self.submit_task(task))
            })
            .collect())
    }

    /// Imports `<collection>-chapter-<n>.zip` files from `dir` into the
    /// library and submits them.
    pub async fn import_directory(
        &self,
        dir: &Path,
    ) -> Result<Vec<(JobId, SubmitOutcome)>, PipelineError> {
        let dir = dir.to_path_buf();
        let layout = self.inner.detector.layout().clone();
        let tasks = tokio::task::spawn_blocking(move || -> Result<Vec<Task>, ImportError> {
            let archives = scan_local_archives(&dir)?;
            import_local_archives(&layout, &archives)
        })
        .await??;

        Ok(tasks
            .into_iter()
            .map(|task| (task.id(), self.submit_task(task)))
            .collect())
    }

    /// Drops every pending job from both queues and returns how many were
    /// dropped. Jobs already running finish, but a download that completes
    /// afterwards is not sent on to translation.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.lock_state();
        let dropped = state.download.pending.len() + state.translate.pending.len();
        state.download.pending.clear();
        state.translate.pending.clear();
        state.generation += 1;
        self.publish(&state);
        info!("cancelled {dropped} queued job(s)");
        dropped
    }

    pub fn status(&self) -> PipelineStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<PipelineStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Applies to translations started after the call.
    pub fn update_settings(&self, settings: TranslatorSettings) {
        let mut guard = self
            .inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = settings;
    }

    pub fn settings(&self) -> TranslatorSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn history(&self) -> &Arc<CompletionHistory> {
        self.inner.runner.history()
    }

    pub fn detector(&self) -> &WorkDetector {
        &self.inner.detector
    }

    pub fn summarize(&self, collection: &str, chapters: &[ChapterRef]) -> CollectionSummary {
        self.inner.detector.summarize(collection, chapters)
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called with the state lock held so snapshots go out in order.
    fn publish(&self, state: &QueueState) {
        let snapshot = PipelineStatus {
            download: state.download.snapshot(),
            translate: state.translate.snapshot(),
            completed_count: self.inner.runner.history().len(),
        };
        self.inner.status_tx.send_replace(snapshot);
    }

    fn emit(&self, event: PipelineEvent) {
        if self.inner.events_tx.send(event).is_err() {
            debug!("no event subscribers");
        }
    }

    fn spawn_worker(&self, stage: Stage) {
        let coordinator = self.clone();
        self.inner.runtime.spawn(async move {
            coordinator.drain(stage).await;
        });
    }

    async fn drain(&self, stage: Stage) {
        debug!("{} worker started", stage.label());
        loop {
            let next = {
                let mut state = self.lock_state();
                let generation = state.generation;
                let queue = state.queue_mut(stage);
                match queue.pending.pop_front() {
                    Some(task) => {
                        queue.current = Some(task.clone());
                        queue.progress = 0.0;
                        self.publish(&state);
                        Some((task, generation))
                    }
                    None => {
                        queue.worker_running = false;
                        None
                    }
                }
            };

            let Some((task, generation)) = next else {
                break;
            };
            match stage {
                Stage::Download => self.process_download(task, generation).await,
                Stage::Translate => self.process_translation(task).await,
            }
        }
        debug!("{} worker idle", stage.label());
    }

    /// Runs `work` as its own task so a panic inside a collaborator ends up
    /// as a failed job instead of unwinding through the worker.
    async fn isolate<T, F>(&self, work: F) -> Result<T, JobFailure>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, JobFailure>> + Send + 'static,
    {
        self.inner
            .runtime
            .spawn(work)
            .await
            .unwrap_or_else(|err| Err(err.into()))
    }

    async fn process_download(&self, task: Task, generation: u64) {
        let job = task.id();
        let source = Arc::clone(&self.inner.source);
        let sink = self.progress_sink(Stage::Download);
        let fetched = task.clone();
        let outcome: Result<PathBuf, JobFailure> = self
            .isolate(async move {
                source
                    .fetch(&fetched, sink)
                    .await
                    .map_err(JobFailure::from)
            })
            .await;

        let (routed, spawn_translator) = {
            let mut state = self.lock_state();
            state.download.finish_current();
            let routed = outcome.is_ok() && state.generation == generation;
            let mut spawn = false;
            if routed && !state.translate.contains(&job) {
                state.translate.pending.push_back(task);
                spawn = state.translate.claim_worker();
            }
            self.publish(&state);
            (routed, spawn)
        };

        match outcome {
            Ok(path) => {
                if routed {
                    info!("{job} downloaded; queued for translation");
                } else {
                    info!("{job} downloaded after cancellation; not translating");
                }
                self.emit(PipelineEvent::DownloadCompleted { job, path });
            }
            Err(failure) => {
                error!("download of {job} failed: {}", failure.message);
                self.emit(PipelineEvent::DownloadFailed {
                    job,
                    kind: failure.kind,
                    message: failure.message,
                });
            }
        }

        if spawn_translator {
            self.spawn_worker(Stage::Translate);
        }
    }

    async fn process_translation(&self, task: Task) {
        let job = task.id();
        let settings = self.settings();
        let coordinator = self.clone();
        let sink = self.progress_sink(Stage::Translate);
        let outcome = self
            .isolate(async move {
                coordinator
                    .inner
                    .runner
                    .run(&task, &settings, sink)
                    .await
                    .map_err(JobFailure::from)
            })
            .await;

        {
            let mut state = self.lock_state();
            state.translate.finish_current();
            self.publish(&state);
        }

        match outcome {
            Ok(path) => self.emit(PipelineEvent::TranslationCompleted { job, path }),
            Err(failure) => {
                error!("translation of {job} failed: {}", failure.message);
                self.emit(PipelineEvent::TranslationFailed {
                    job,
                    kind: failure.kind,
                    message: failure.message,
                });
            }
        }
    }

    fn progress_sink(&self, stage: Stage) -> ProgressSink {
        let coordinator = self.clone();
        Arc::new(move |value| coordinator.set_progress(stage, value))
    }

    fn set_progress(&self, stage: Stage, value: f32) {
        let mut state = self.lock_state();
        let queue = state.queue_mut(stage);
        if queue.current.is_none() {
            return;
        }
        queue.progress = value.clamp(0.0, 100.0);
        self.publish(&state);
    }
}

impl std::fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("library", &self.inner.detector.layout().root())
            .finish_non_exhaustive()
    }
}
