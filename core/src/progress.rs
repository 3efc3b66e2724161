//! Progress inferred from the translator's side effects.
//!
//! The external translator reports nothing while it runs, so the estimator
//! counts finished pages in the output directory on a fixed interval.

use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::layout::count_images;

/// Receives percentages in `0.0..=100.0`.
pub type ProgressSink = Arc<dyn Fn(f32) + Send + Sync>;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub fn noop_sink() -> ProgressSink {
    Arc::new(|_| {})
}

pub fn percentage(processed: usize, total: usize) -> f32 {
    if total == 0 {
        return 0.0;
    }
    ((processed as f32) / (total as f32) * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    output_dir: PathBuf,
    total: usize,
    interval: Duration,
}

impl ProgressEstimator {
    pub fn new(output_dir: impl Into<PathBuf>, total: usize) -> Self {
        Self {
            output_dir: output_dir.into(),
            total,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One reading of the output directory.
    pub fn sample(&self) -> std::io::Result<f32> {
        let translated = count_images(&self.output_dir)?;
        Ok(percentage(translated, self.total))
    }

    /// Starts polling on its own task. Readings handed to `sink` never go
    /// down. The returned handle must be stopped when the translator returns;
    /// dropping it aborts the poller.
    pub fn spawn(self, sink: ProgressSink) -> ProgressHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut reported = 0.0_f32;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        self.poll_once(&sink, &mut reported);
                        break;
                    }
                    _ = ticker.tick() => {
                        self.poll_once(&sink, &mut reported);
                    }
                }
            }
        });

        ProgressHandle {
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    fn poll_once(&self, sink: &ProgressSink, reported: &mut f32) {
        match self.sample() {
            Ok(value) => {
                if value > *reported {
                    *reported = value;
                }
                debug!(
                    "translation progress for {}: {:.1}%",
                    self.output_dir.display(),
                    *reported
                );
                sink(*reported);
            }
            Err(err) => {
                warn!(
                    "skipping progress poll of {}: {}",
                    self.output_dir.display(),
                    err
                );
            }
        }
    }
}

pub struct ProgressHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ProgressHandle {
    /// Takes a final reading and waits for the poller to finish.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!("progress poller ended abnormally: {err}");
            }
        }
    }
}

impl Drop for ProgressHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn recording_sink() -> (ProgressSink, Arc<Mutex<Vec<f32>>>) {
        let readings = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&readings);
        let sink: ProgressSink = Arc::new(move |value| captured.lock().unwrap().push(value));
        (sink, readings)
    }

    #[test]
    fn percentage_handles_zero_total() {
        assert_eq!(percentage(3, 0), 0.0);
        assert_eq!(percentage(1, 4), 25.0);
        assert_eq!(percentage(5, 4), 100.0);
    }

    #[tokio::test]
    async fn readings_rise_and_end_at_full() {
        let dir = tempdir().unwrap();
        let output = dir.path().to_path_buf();
        let (sink, readings) = recording_sink();

        let handle = ProgressEstimator::new(&output, 4)
            .with_interval(Duration::from_millis(5))
            .spawn(sink);

        for index in 0..4 {
            tokio::time::sleep(Duration::from_millis(15)).await;
            fs::write(output.join(format!("{index:03}.png")), b"page").unwrap();
        }
        handle.stop().await;

        let readings = readings.lock().unwrap().clone();
        assert!(!readings.is_empty());
        assert!(readings.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(readings.last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn readings_never_drop_when_files_disappear() {
        let dir = tempdir().unwrap();
        let output = dir.path().to_path_buf();
        fs::write(output.join("001.jpg"), b"page").unwrap();
        fs::write(output.join("002.jpg"), b"page").unwrap();
        let (sink, readings) = recording_sink();

        let estimator = ProgressEstimator::new(&output, 2).with_interval(Duration::from_millis(5));
        let handle = estimator.spawn(sink);
        tokio::time::sleep(Duration::from_millis(20)).await;
        fs::remove_file(output.join("002.jpg")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop().await;

        let readings = readings.lock().unwrap().clone();
        assert!(readings.iter().all(|value| *value == 100.0));
    }

    #[tokio::test]
    async fn missing_directory_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("not-yet-created");
        let (sink, readings) = recording_sink();

        let handle = ProgressEstimator::new(&output, 2)
            .with_interval(Duration::from_millis(5))
            .spawn(sink);
        tokio::time::sleep(Duration::from_millis(20)).await;
        fs::create_dir_all(&output).unwrap();
        fs::write(output.join("001.jpg"), b"page").unwrap();
        handle.stop().await;

        let readings = readings.lock().unwrap().clone();
        assert_eq!(readings.last().copied(), Some(50.0));
    }
}
