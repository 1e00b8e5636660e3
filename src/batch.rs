use crate::download::{
    download_url_for, execute_download, new_id, validate_url, DownloadContext, DownloadOutcome,
    DownloadPlan, ProgressSink,
};
use crate::job::{BatchJob, JobCompletion};
use crate::joblog;
use crate::paths::AppPaths;
use crate::progress::ProgressUpdate;
use crate::store::{BatchStore, BatchWriter, TaskHandle};
use crate::ytdlp::{DownloadOptions, DownloadProfile, Playlist};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

pub const MAX_BATCH_ITEMS: usize = 1500;
const SWEEPER_TICK_MS: u64 = 250;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchVideoRequest {
    pub url: String,
    pub title: Option<String>,
    pub quality: Option<String>,
    pub format: Option<String>,
    pub audio_only: bool,
    /// Defaults to true.
    pub turbo: Option<bool>,
}

/// Body of `POST /download/parallel`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParallelDownloadRequest {
    pub videos: Vec<BatchVideoRequest>,
    pub max_concurrent: Option<usize>,
}

impl ParallelDownloadRequest {
    /// One item per playlist entry, titled after the entry.
    pub fn from_playlist(playlist: &Playlist, max_concurrent: Option<usize>) -> Self {
        Self {
            videos: playlist
                .videos
                .iter()
                .map(|entry| BatchVideoRequest {
                    url: entry.url.clone(),
                    title: entry.title.clone(),
                    ..BatchVideoRequest::default()
                })
                .collect(),
            max_concurrent,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAccepted {
    pub batch_id: String,
    pub total: usize,
}

struct ItemSink<'a> {
    writer: &'a BatchWriter,
    index: usize,
}

impl ProgressSink for ItemSink<'_> {
    fn begin_attempt(&self, turbo: bool) {
        self.writer.update(|batch| {
            if let Some(job) = batch.item_mut(self.index) {
                job.begin_attempt(turbo);
            }
        });
    }

    fn apply(&self, update: &ProgressUpdate, processing_at_full: bool) {
        self.writer.update(|batch| {
            if let Some(job) = batch.item_mut(self.index) {
                job.apply_progress(update, processing_at_full);
            }
        });
    }

    fn begin_retry(&self) {
        self.writer.update(|batch| {
            if let Some(job) = batch.item_mut(self.index) {
                job.begin_retry();
            }
        });
    }
}

/// Runs batches with at most K extraction processes in flight per batch.
pub struct BatchController {
    ctx: DownloadContext,
    batches: Arc<BatchStore>,
}

impl BatchController {
    pub fn new(ctx: DownloadContext, batches: Arc<BatchStore>) -> Self {
        Self { ctx, batches }
    }

    pub fn batches(&self) -> &Arc<BatchStore> {
        &self.batches
    }

    pub fn start(&self, request: ParallelDownloadRequest) -> Result<BatchAccepted> {
        if request.videos.is_empty() {
            return Err(EngineError::InvalidRequest(
                "no videos to download".to_string(),
            ));
        }
        if request.videos.len() > MAX_BATCH_ITEMS {
            return Err(EngineError::InvalidRequest(format!(
                "too many videos in one batch: {} (max {MAX_BATCH_ITEMS})",
                request.videos.len()
            )));
        }
        let urls = request
            .videos
            .iter()
            .enumerate()
            .map(|(i, video)| {
                validate_url(&video.url).map_err(|e| {
                    EngineError::InvalidRequest(format!("video {}: {e}", i + 1))
                })
            })
            .collect::<Result<Vec<String>>>()?;

        let max_concurrent = self.ctx.settings.clamp_concurrency(request.max_concurrent);
        let id = new_id();
        let output_dir = self.ctx.paths.batch_dir(&id);
        std::fs::create_dir_all(&output_dir)?;

        let plans: Vec<DownloadPlan> = request
            .videos
            .iter()
            .zip(&urls)
            .map(|(video, url)| {
                let options = DownloadOptions {
                    quality: video.quality.clone(),
                    format: video.format.clone(),
                    audio_only: video.audio_only,
                    ..DownloadOptions::default()
                };
                DownloadPlan::new(
                    &self.ctx,
                    DownloadProfile::BatchItem,
                    url,
                    &options,
                    output_dir.clone(),
                    None,
                    video.turbo.unwrap_or(true),
                )
            })
            .collect();

        let items: Vec<(String, String)> = request
            .videos
            .iter()
            .zip(urls)
            .enumerate()
            .map(|(i, (video, url))| {
                let title = video
                    .title
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Video {}", i + 1));
                (url, title)
            })
            .collect();
        let total = items.len();

        let writer = self.batches.create(
            id.clone(),
            BatchJob::new(id.clone(), items, max_concurrent, output_dir),
        )?;
        self.ctx.log(
            &id,
            "info",
            "batch_created",
            serde_json::json!({ "total": total, "max_concurrent": max_concurrent }),
        );

        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let ctx = self.ctx.clone();
        let spawned = thread::Builder::new()
            .name(format!("batch-{id}"))
            .spawn(move || run_batch(&ctx, &writer, &plans, max_concurrent, &flag));

        match spawned {
            Ok(_detached) => {
                self.batches.attach_task(&id, TaskHandle::new(cancel));
                Ok(BatchAccepted {
                    batch_id: id,
                    total,
                })
            }
            Err(err) => {
                self.batches.remove(&id);
                Err(EngineError::Io(err))
            }
        }
    }

    /// Stops every running item; items still waiting end as canceled.
    pub fn cancel(&self, id: &str) -> Result<bool> {
        let batch = self.batches.require(id)?;
        if batch.is_complete() {
            return Ok(false);
        }
        Ok(self.batches.cancel(id))
    }
}

fn run_batch(
    ctx: &DownloadContext,
    writer: &BatchWriter,
    plans: &[DownloadPlan],
    max_concurrent: usize,
    cancel: &AtomicBool,
) {
    let queue: Mutex<VecDeque<usize>> = Mutex::new((0..plans.len()).collect());
    let workers = max_concurrent.clamp(1, plans.len().max(1));
    let started = Instant::now();

    thread::scope(|scope| {
        for worker in 0..workers {
            let queue = &queue;
            let spawned = thread::Builder::new()
                .name(format!("batch-{}-{worker}", writer.id()))
                .spawn_scoped(scope, move || worker_loop(ctx, writer, plans, queue, cancel));
            if let Err(err) = spawned {
                ctx.log(
                    writer.id(),
                    "error",
                    "worker_spawn_failed",
                    serde_json::json!({ "worker": worker, "error": err.to_string() }),
                );
            }
        }
    });

    // Canceled batches, or batches whose workers never started, leave items queued.
    let leftover: Vec<usize> = queue
        .into_inner()
        .unwrap_or_else(|e| e.into_inner())
        .into_iter()
        .collect();
    let reason = if cancel.load(Ordering::SeqCst) {
        EngineError::Canceled.to_string()
    } else {
        "no worker available".to_string()
    };
    writer.update(|batch| {
        for index in &leftover {
            batch.finish_item(*index, Err(reason.clone()));
        }
    });

    if let Some(batch) = writer.snapshot() {
        ctx.log(
            writer.id(),
            "info",
            "batch_finished",
            serde_json::json!({
                "completed": batch.completed,
                "failed": batch.failed,
                "elapsed_ms": started.elapsed().as_millis() as u64,
            }),
        );
    }
}

fn worker_loop(
    ctx: &DownloadContext,
    writer: &BatchWriter,
    plans: &[DownloadPlan],
    queue: &Mutex<VecDeque<usize>>,
    cancel: &AtomicBool,
) {
    loop {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        let Some(index) = next else {
            return;
        };
        let Some(plan) = plans.get(index) else {
            continue;
        };
        if !writer.update(|batch| batch.start_item(index)).unwrap_or(false) {
            continue;
        }

        let item_id = BatchJob::item_id(writer.id(), index);
        let sink = ItemSink { writer, index };
        let outcome = match execute_download(ctx, plan, &sink, cancel, writer.id()) {
            Ok(outcome) => Ok(item_completion(ctx, outcome)),
            Err(err) => {
                ctx.log(
                    writer.id(),
                    "warn",
                    "item_failed",
                    serde_json::json!({ "item": item_id, "error": err.to_string() }),
                );
                Err(err.to_string())
            }
        };
        writer.update(|batch| batch.finish_item(index, outcome));
    }
}

fn item_completion(ctx: &DownloadContext, outcome: DownloadOutcome) -> JobCompletion {
    let path = outcome.artifact.path().map(Path::to_path_buf);
    JobCompletion {
        filename: path
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().to_string()),
        download_url: path
            .as_deref()
            .and_then(|p| download_url_for(&ctx.paths.default_download_dir(), p)),
        artifact_path: path,
        note: None,
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepSummary {
    pub removed_batches: Vec<String>,
    pub removed_paths: Vec<PathBuf>,
    pub errors: Vec<String>,
}

/// Drops batch records older than `retention` together with their folders and archives.
/// Leftover `batch_*` folders with no record (e.g. from an earlier run) age out the same way.
pub fn sweep_stale_batches(
    paths: &AppPaths,
    batches: &BatchStore,
    retention: Duration,
) -> SweepSummary {
    let mut summary = SweepSummary::default();
    let mut handled: HashSet<PathBuf> = HashSet::new();

    for (id, batch) in batches.sweep_older_than(retention) {
        for path in [batch.output_dir.clone(), paths.batch_archive_path(&id)] {
            handled.insert(path.clone());
            remove_path(&path, &mut summary);
        }
        let _ = joblog::log_line(
            paths,
            &id,
            "info",
            "batch_swept",
            serde_json::json!({ "retention_secs": retention.as_secs() }),
        );
        summary.removed_batches.push(id);
    }

    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let Ok(entries) = std::fs::read_dir(paths.default_download_dir()) else {
        return summary;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if handled.contains(&path) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(id) = name
            .strip_prefix("batch_")
            .map(|rest| rest.trim_end_matches(".zip"))
        else {
            continue;
        };
        if batches.get(id).is_some() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::now());
        if modified <= cutoff {
            remove_path(&path, &mut summary);
        }
    }

    summary
}

fn remove_path(path: &Path, summary: &mut SweepSummary) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else if path.exists() {
        std::fs::remove_file(path)
    } else {
        return;
    };
    match result {
        Ok(()) => summary.removed_paths.push(path.to_path_buf()),
        Err(err) => summary
            .errors
            .push(format!("{}: {err}", path.to_string_lossy())),
    }
}

/// Background retention sweep. Stops when the handle is stopped or dropped.
pub struct SweeperHandle {
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn start_sweeper(
    paths: AppPaths,
    batches: Arc<BatchStore>,
    retention: Duration,
    interval: Duration,
) -> Result<SweeperHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_thread = Arc::clone(&stop);
    let interval = interval.max(Duration::from_secs(1));

    let worker = thread::Builder::new()
        .name("batch-sweeper".to_string())
        .spawn(move || {
            let mut next_run = Instant::now() + interval;
            while !stop_thread.load(Ordering::SeqCst) {
                if Instant::now() < next_run {
                    thread::sleep(Duration::from_millis(SWEEPER_TICK_MS));
                    continue;
                }
                let summary = sweep_stale_batches(&paths, &batches, retention);
                if !summary.removed_batches.is_empty() || !summary.errors.is_empty() {
                    let _ = joblog::log_line(
                        &paths,
                        "batch-sweeper",
                        if summary.errors.is_empty() { "info" } else { "warn" },
                        "sweep_finished",
                        serde_json::json!(summary),
                    );
                }
                next_run = Instant::now() + interval;
            }
        })?;

    Ok(SweeperHandle {
        stop,
        worker: Some(worker),
    })
}
