use crate::progress::ProgressUpdate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Batch item waiting for a free slot.
    Pending,
    Starting,
    Downloading,
    Processing,
    Uploading,
    Retrying,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Starting => "starting",
            JobStatus::Downloading => "downloading",
            JobStatus::Processing => "processing",
            JobStatus::Uploading => "uploading",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }
}

/// What a successful job hands to polling clients.
#[derive(Debug, Clone, Default)]
pub struct JobCompletion {
    pub filename: Option<String>,
    pub download_url: Option<String>,
    pub artifact_path: Option<PathBuf>,
    /// Display text shown in the speed field, e.g. an upload outcome.
    pub note: Option<String>,
}

/// One tracked download. Mutated only through the transition methods below.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip)]
    pub artifact_path: Option<PathBuf>,
    pub attempts: u32,
    pub turbo: bool,
}

impl Job {
    pub fn new(id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id: id.into(),
            status,
            progress: 0.0,
            speed: None,
            eta: None,
            error: None,
            download_url: None,
            filename: None,
            artifact_path: None,
            attempts: 0,
            turbo: false,
        }
    }

    pub fn starting(id: impl Into<String>) -> Self {
        Self::new(id, JobStatus::Starting)
    }

    pub fn pending(id: impl Into<String>) -> Self {
        Self::new(id, JobStatus::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Records a new process invocation. A job already in `retrying` keeps that status
    /// until the retry reports progress.
    pub fn begin_attempt(&mut self, turbo: bool) {
        if self.is_terminal() {
            return;
        }
        self.attempts += 1;
        self.turbo = turbo;
        if self.status != JobStatus::Retrying {
            self.status = JobStatus::Starting;
        }
    }

    /// Merges parsed output. Returns whether anything visible changed.
    pub fn apply_progress(&mut self, update: &ProgressUpdate, processing_at_full: bool) -> bool {
        if self.is_terminal() {
            return false;
        }
        let before = (self.status, self.progress, self.speed.clone(), self.eta.clone());

        if let Some(percent) = update.percent {
            let percent = if percent.is_finite() {
                percent.clamp(0.0, 100.0)
            } else {
                0.0
            };
            self.progress = self.progress.max(percent);
        }
        if let Some(speed) = &update.speed {
            self.speed = Some(speed.clone());
        }
        if let Some(eta) = &update.eta {
            self.eta = Some(eta.clone());
        }

        match self.status {
            JobStatus::Processing | JobStatus::Uploading => {}
            _ if processing_at_full && self.progress >= 100.0 => {
                self.status = JobStatus::Processing;
            }
            _ if update.percent.is_some() => self.status = JobStatus::Downloading,
            _ => {}
        }

        before != (self.status, self.progress, self.speed.clone(), self.eta.clone())
    }

    /// The single permitted progress reset: the accelerated attempt failed and a plain
    /// attempt follows.
    pub fn begin_retry(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = JobStatus::Retrying;
        self.progress = 0.0;
        self.speed = None;
        self.eta = None;
    }

    pub fn mark_uploading(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = JobStatus::Uploading;
        self.progress = 100.0;
        self.eta = None;
        self.speed = None;
    }

    pub fn complete(&mut self, completion: JobCompletion) {
        if self.is_terminal() {
            return;
        }
        self.status = JobStatus::Completed;
        self.progress = 100.0;
        self.eta = None;
        self.speed = completion.note;
        self.error = None;
        self.filename = completion.filename;
        self.download_url = completion.download_url;
        self.artifact_path = completion.artifact_path;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.status = JobStatus::Error;
        self.error = Some(message.into());
        self.speed = None;
        self.eta = None;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub url: String,
    pub title: String,
    #[serde(flatten)]
    pub job: Job,
}

/// A set of items downloaded under one concurrency cap.
///
/// Counters move only through `start_item` and `finish_item`, which keep
/// `completed + failed + downloading <= total`. Items are shared between published
/// copies of the batch, so an update clones only the item it touches.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub id: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub downloading: usize,
    pub videos: Vec<Arc<BatchItem>>,
    pub max_concurrent: usize,
    pub output_dir: PathBuf,
}

impl BatchJob {
    pub fn new(
        id: impl Into<String>,
        items: Vec<(String, String)>,
        max_concurrent: usize,
        output_dir: PathBuf,
    ) -> Self {
        let id = id.into();
        let videos: Vec<Arc<BatchItem>> = items
            .into_iter()
            .enumerate()
            .map(|(index, (url, title))| {
                Arc::new(BatchItem {
                    url,
                    title,
                    job: Job::pending(Self::item_id(&id, index)),
                })
            })
            .collect();
        Self {
            id,
            total: videos.len(),
            completed: 0,
            failed: 0,
            downloading: 0,
            videos,
            max_concurrent,
            output_dir,
        }
    }

    pub fn item_id(batch_id: &str, index: usize) -> String {
        format!("{batch_id}_{index}")
    }

    /// Moves a pending item into a worker slot.
    pub fn start_item(&mut self, index: usize) -> bool {
        let Some(job) = self.item_mut(index) else {
            return false;
        };
        if job.status != JobStatus::Pending {
            return false;
        }
        job.status = JobStatus::Starting;
        self.downloading += 1;
        true
    }

    /// Access for in-flight transitions. Terminal transitions go through `finish_item`.
    pub fn item_mut(&mut self, index: usize) -> Option<&mut Job> {
        self.videos
            .get_mut(index)
            .map(|item| &mut Arc::make_mut(item).job)
    }

    pub fn finish_item(
        &mut self,
        index: usize,
        outcome: std::result::Result<JobCompletion, String>,
    ) -> bool {
        let Some(job) = self.item_mut(index) else {
            return false;
        };
        if job.is_terminal() {
            return false;
        }
        let was_active = job.status != JobStatus::Pending;
        let completed = outcome.is_ok();
        match outcome {
            Ok(completion) => job.complete(completion),
            Err(message) => job.fail(message),
        }
        if completed {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        if was_active {
            self.downloading = self.downloading.saturating_sub(1);
        }
        true
    }

    /// Rounded mean of item percentages; items not yet started count as 0.
    pub fn progress(&self) -> f64 {
        if self.videos.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.videos.iter().map(|item| item.job.progress).sum();
        (sum / self.videos.len() as f64).round()
    }

    pub fn speed(&self) -> String {
        self.videos
            .iter()
            .filter(|item| item.job.status == JobStatus::Downloading)
            .filter_map(|item| item.job.speed.as_deref())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn is_complete(&self) -> bool {
        self.completed + self.failed == self.total
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            batch_id: self.id.clone(),
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            downloading: self.downloading,
            progress: self.progress(),
            speed: self.speed(),
            videos: self.videos.iter().map(|item| (**item).clone()).collect(),
            is_complete: self.is_complete(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSnapshot {
    pub batch_id: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub downloading: usize,
    pub progress: f64,
    pub speed: String,
    pub videos: Vec<BatchItem>,
    pub is_complete: bool,
}
