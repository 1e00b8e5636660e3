use crate::config::EngineSettings;
use crate::job::{Job, JobCompletion};
use crate::joblog;
use crate::paths::AppPaths;
use crate::process::{self, OutputStream, ProcessSpec, RunControl};
use crate::progress::{is_partial_artifact_path, ProgressParser, ProgressUpdate};
use crate::store::{JobStore, JobWriter, TaskHandle};
use crate::tools::{self, ToolCommand};
use crate::upload::ArtifactUploader;
use crate::ytdlp::{self, DownloadOptions, DownloadProfile, OutputLayout};
use crate::{EngineError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

/// Everything a download worker needs besides its own record.
#[derive(Clone)]
pub struct DownloadContext {
    pub paths: AppPaths,
    pub settings: Arc<EngineSettings>,
    pub uploader: Option<Arc<dyn ArtifactUploader>>,
}

impl DownloadContext {
    pub fn new(paths: AppPaths, settings: EngineSettings) -> Self {
        Self {
            paths,
            settings: Arc::new(settings),
            uploader: None,
        }
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn ArtifactUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn ytdlp(&self) -> ToolCommand {
        tools::resolve_ytdlp(&self.paths, &self.settings)
    }

    pub fn accelerator(&self) -> Option<PathBuf> {
        tools::accelerator_path(&self.paths, &self.settings)
    }

    pub fn cookies(&self) -> Option<PathBuf> {
        let path = self.paths.cookies_path();
        path.is_file().then_some(path)
    }

    fn output_layout(&self, output_dir: PathBuf, temp_dir: Option<PathBuf>) -> OutputLayout {
        OutputLayout {
            output_dir,
            temp_dir,
            cookies: self.cookies(),
            ffmpeg_location: tools::ffmpeg_location(&self.paths, &self.settings),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        match self.settings.download_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    fn recovery_window(&self) -> Duration {
        Duration::from_secs(self.settings.artifact_recovery_window_secs)
    }

    /// Best effort: a failed log write never fails the job.
    pub(crate) fn log(&self, id: &str, level: &str, event: &str, data: serde_json::Value) {
        let _ = joblog::log_line(&self.paths, id, level, event, data);
    }
}

/// Receives state transitions while a download runs.
pub trait ProgressSink {
    fn begin_attempt(&self, turbo: bool);
    fn apply(&self, update: &ProgressUpdate, processing_at_full: bool);
    fn begin_retry(&self);
}

impl ProgressSink for JobWriter {
    fn begin_attempt(&self, turbo: bool) {
        self.update(|job| job.begin_attempt(turbo));
    }

    fn apply(&self, update: &ProgressUpdate, processing_at_full: bool) {
        self.update(|job| job.apply_progress(update, processing_at_full));
    }

    fn begin_retry(&self) {
        self.update(|job| job.begin_retry());
    }
}

/// A fully built download: arguments without accelerator flags plus where output lands.
#[derive(Debug, Clone)]
pub struct DownloadPlan {
    pub profile: DownloadProfile,
    pub url: String,
    pub args: Vec<String>,
    pub output_dir: PathBuf,
    pub temp_dir: Option<PathBuf>,
    /// Try the accelerator first when it is installed.
    pub turbo: bool,
    pub processing_at_full: bool,
}

impl DownloadPlan {
    pub fn new(
        ctx: &DownloadContext,
        profile: DownloadProfile,
        url: &str,
        options: &DownloadOptions,
        output_dir: PathBuf,
        temp_dir: Option<PathBuf>,
        turbo: bool,
    ) -> Self {
        let layout = ctx.output_layout(output_dir.clone(), temp_dir.clone());
        Self {
            profile,
            url: url.to_string(),
            args: ytdlp::build_download_args(profile, options, &layout, url),
            output_dir,
            temp_dir,
            turbo,
            processing_at_full: profile == DownloadProfile::Fast,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactResolution {
    /// Named by the tool's own output.
    Parsed(PathBuf),
    /// Found by scanning the output directory after a silent success.
    Recovered(PathBuf),
    /// Success without a resolvable file.
    Unresolved,
}

impl ArtifactResolution {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ArtifactResolution::Parsed(p) | ArtifactResolution::Recovered(p) => Some(p),
            ArtifactResolution::Unresolved => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        !matches!(self, ArtifactResolution::Parsed(_))
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub artifact: ArtifactResolution,
    pub accelerated: bool,
}

#[derive(Debug, Clone)]
struct AttemptOutcome {
    destination: Option<PathBuf>,
    finished_at: SystemTime,
    accelerated: bool,
}

/// Turbo first, then at most one plain retry.
///
/// The retry happens only when the accelerated attempt failed in a way a plain run can fix
/// (see [`EngineError::allows_plain_retry`]). `on_fallback` runs between the two attempts.
pub fn run_with_fallback<T>(
    accelerator: Option<&Path>,
    mut attempt: impl FnMut(Option<&Path>) -> Result<T>,
    on_fallback: impl FnOnce(&EngineError),
) -> Result<T> {
    let Some(accelerator) = accelerator else {
        return attempt(None);
    };

    match attempt(Some(accelerator)) {
        Ok(value) => Ok(value),
        Err(first) if first.allows_plain_retry() => {
            on_fallback(&first);
            match attempt(None) {
                Ok(value) => Ok(value),
                Err(EngineError::Canceled) => Err(EngineError::Canceled),
                Err(second) => Err(EngineError::RetryExhausted {
                    accelerated: first.to_string(),
                    plain: second.to_string(),
                }),
            }
        }
        Err(first) => Err(first),
    }
}

/// Runs a plan to completion, reporting through `sink`, and resolves the produced file.
pub fn execute_download(
    ctx: &DownloadContext,
    plan: &DownloadPlan,
    sink: &dyn ProgressSink,
    cancel: &AtomicBool,
    log_id: &str,
) -> Result<DownloadOutcome> {
    let ytdlp = ctx.ytdlp();
    let accelerator = if plan.turbo { ctx.accelerator() } else { None };
    let control = RunControl {
        cancel: Some(cancel),
        timeout: ctx.timeout(),
    };

    let outcome = run_with_fallback(
        accelerator.as_deref(),
        |accel| {
            sink.begin_attempt(accel.is_some());
            let args = match accel {
                Some(path) => {
                    ytdlp::with_accelerator(&plan.args, path, &ctx.settings.tools.accelerator_args)
                }
                None => plan.args.clone(),
            };
            let spec = ytdlp.process_spec(&args);
            ctx.log(
                log_id,
                "info",
                "attempt_started",
                serde_json::json!({
                    "accelerated": accel.is_some(),
                    "command": spec.display_command(),
                }),
            );
            run_attempt(&spec, sink, plan.processing_at_full, control)
                .map(|mut outcome| {
                    outcome.accelerated = accel.is_some();
                    outcome
                })
        },
        |err| {
            ctx.log(
                log_id,
                "warn",
                "accelerated_attempt_failed",
                serde_json::json!({ "error": err.to_string() }),
            );
            sink.begin_retry();
        },
    )?;

    let artifact = resolve_artifact(
        outcome.destination.as_deref(),
        &plan.output_dir,
        outcome.finished_at,
        ctx.recovery_window(),
    );
    Ok(DownloadOutcome {
        artifact,
        accelerated: outcome.accelerated,
    })
}

fn run_attempt(
    spec: &ProcessSpec,
    sink: &dyn ProgressSink,
    processing_at_full: bool,
    control: RunControl<'_>,
) -> Result<AttemptOutcome> {
    let handle = process::spawn(spec)?;

    let mut stdout_parser = ProgressParser::new();
    let mut stderr_parser = ProgressParser::new();
    let exit = process::run_to_completion(handle, control, |chunk| {
        let update = match chunk.stream {
            OutputStream::Stdout => stdout_parser.feed(&chunk.text),
            OutputStream::Stderr => stderr_parser.feed(&chunk.text),
        };
        if !update.is_empty() {
            sink.apply(&update, processing_at_full);
        }
    })?;
    for update in [stdout_parser.finish(), stderr_parser.finish()] {
        if !update.is_empty() {
            sink.apply(&update, processing_at_full);
        }
    }

    let exit = exit.ensure_success(&spec.tool)?;
    let destination = stdout_parser
        .destination()
        .or_else(|| stderr_parser.destination())
        .map(Path::to_path_buf);
    Ok(AttemptOutcome {
        destination,
        finished_at: exit.finished_at,
        accelerated: false,
    })
}

pub fn resolve_artifact(
    destination: Option<&Path>,
    output_dir: &Path,
    finished_at: SystemTime,
    window: Duration,
) -> ArtifactResolution {
    if let Some(dest) = destination {
        let dest = if dest.is_absolute() {
            dest.to_path_buf()
        } else {
            output_dir.join(dest)
        };
        if dest.is_file() {
            return ArtifactResolution::Parsed(dest);
        }
    }

    let since = finished_at
        .checked_sub(window)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    match find_recent_artifact(output_dir, since) {
        Some(path) => ArtifactResolution::Recovered(path),
        None => ArtifactResolution::Unresolved,
    }
}

/// Newest regular, non-partial file in `dir` modified at or after `since`.
pub fn find_recent_artifact(dir: &Path, since: SystemTime) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut best: Option<(SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let path = entry.path();
        if is_partial_artifact_path(&path.to_string_lossy()) {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if modified < since {
            continue;
        }
        if best.as_ref().map_or(true, |(t, _)| modified > *t) {
            best = Some((modified, path));
        }
    }
    best.map(|(_, path)| path)
}

/// Public URL of an artifact under the served downloads root.
pub fn download_url_for(root: &Path, artifact: &Path) -> Option<String> {
    let rel = artifact.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(format!("/downloads/{}", parts.join("/")))
}

pub fn validate_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidRequest("url is required".to_string()));
    }
    let parsed = url::Url::parse(trimmed)
        .map_err(|e| EngineError::InvalidRequest(format!("invalid url {trimmed}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(trimmed.to_string()),
        other => Err(EngineError::InvalidRequest(format!(
            "unsupported url scheme: {other}"
        ))),
    }
}

fn validate_filename(name: Option<&str>) -> Result<()> {
    let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
        return Ok(());
    };
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(EngineError::InvalidRequest(format!(
            "filename must not contain path separators: {name}"
        )));
    }
    Ok(())
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Body of `POST /download`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadRequest {
    pub url: String,
    pub quality: Option<String>,
    pub format: Option<String>,
    pub audio_only: bool,
    pub filename: Option<String>,
    pub output_path: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub download_subtitles: bool,
    pub subs_lang: Option<String>,
    pub embed_metadata: bool,
    pub turbo: bool,
    pub auto_upload: bool,
    pub delete_after_upload: bool,
}

impl DownloadRequest {
    fn options(&self) -> DownloadOptions {
        DownloadOptions {
            quality: self.quality.clone(),
            format: self.format.clone(),
            audio_only: self.audio_only,
            filename: self.filename.clone(),
            start_time: self.start_time.clone(),
            end_time: self.end_time.clone(),
            subtitles: self.download_subtitles,
            subtitle_langs: self.subs_lang.clone(),
            embed_metadata: self.embed_metadata,
        }
    }
}

/// Body of `POST /download/fast`. Always tries the accelerator first.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FastDownloadRequest {
    pub url: String,
    pub quality: Option<String>,
    pub format: Option<String>,
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
struct UploadStep {
    auto_upload: bool,
    delete_after_upload: bool,
}

/// Drives single downloads from `starting` to a terminal state on detached workers.
pub struct SingleJobController {
    ctx: DownloadContext,
    jobs: Arc<JobStore>,
}

impl SingleJobController {
    pub fn new(ctx: DownloadContext, jobs: Arc<JobStore>) -> Self {
        Self { ctx, jobs }
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    pub fn start(&self, request: DownloadRequest) -> Result<String> {
        let url = validate_url(&request.url)?;
        validate_filename(request.filename.as_deref())?;
        let output_dir = self.output_dir(request.output_path.as_deref())?;

        let plan = DownloadPlan::new(
            &self.ctx,
            DownloadProfile::Standard,
            &url,
            &request.options(),
            output_dir,
            None,
            request.turbo,
        );
        let upload = UploadStep {
            auto_upload: request.auto_upload,
            delete_after_upload: request.delete_after_upload,
        };
        self.spawn_job(new_id(), plan, upload)
    }

    pub fn start_fast(&self, request: FastDownloadRequest) -> Result<String> {
        let url = validate_url(&request.url)?;
        let output_dir = self.output_dir(request.output_path.as_deref())?;
        let id = new_id();
        let temp_dir = AppPaths::job_temp_dir(&output_dir, &id);
        let options = DownloadOptions {
            quality: request.quality,
            format: request.format,
            ..DownloadOptions::default()
        };

        let plan = DownloadPlan::new(
            &self.ctx,
            DownloadProfile::Fast,
            &url,
            &options,
            output_dir,
            Some(temp_dir),
            true,
        );
        self.spawn_job(id, plan, UploadStep::default())
    }

    /// Kills the job's running process. The job ends in `error` with "download canceled".
    pub fn cancel(&self, id: &str) -> Result<bool> {
        let job = self.jobs.require(id)?;
        if job.is_terminal() {
            return Ok(false);
        }
        Ok(self.jobs.cancel(id))
    }

    fn output_dir(&self, requested: Option<&str>) -> Result<PathBuf> {
        let dir = match requested.map(str::trim).filter(|p| !p.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => self.ctx.paths.effective_download_dir()?,
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn spawn_job(&self, id: String, plan: DownloadPlan, upload: UploadStep) -> Result<String> {
        let writer = self.jobs.create(id.clone(), Job::starting(id.clone()))?;
        self.ctx.log(
            &id,
            "info",
            "job_created",
            serde_json::json!({
                "url": plan.url,
                "profile": plan.profile,
                "turbo": plan.turbo,
                "output_dir": plan.output_dir.to_string_lossy(),
            }),
        );

        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let ctx = self.ctx.clone();
        let spawned = thread::Builder::new()
            .name(format!("download-{id}"))
            .spawn(move || run_job(&ctx, &writer, &plan, upload, &flag));

        match spawned {
            Ok(_detached) => {
                self.jobs.attach_task(&id, TaskHandle::new(cancel));
                Ok(id)
            }
            Err(err) => {
                self.jobs.remove(&id);
                Err(EngineError::Io(err))
            }
        }
    }
}

fn run_job(
    ctx: &DownloadContext,
    writer: &JobWriter,
    plan: &DownloadPlan,
    upload: UploadStep,
    cancel: &AtomicBool,
) {
    let id = writer.id().to_string();
    if let Some(temp) = &plan.temp_dir {
        if let Err(err) = std::fs::create_dir_all(temp) {
            ctx.log(
                &id,
                "warn",
                "temp_dir_failed",
                serde_json::json!({ "error": err.to_string() }),
            );
        }
    }

    let result = execute_download(ctx, plan, writer, cancel, &id);

    if let Some(temp) = &plan.temp_dir {
        if temp.exists() {
            let _ = std::fs::remove_dir_all(temp);
        }
    }

    match result {
        Ok(outcome) => finish_success(ctx, writer, plan, outcome, upload),
        Err(err) => {
            ctx.log(
                &id,
                "error",
                "job_failed",
                serde_json::json!({ "error": err.to_string() }),
            );
            writer.update(|job| job.fail(err.to_string()));
        }
    }
}

fn finish_success(
    ctx: &DownloadContext,
    writer: &JobWriter,
    plan: &DownloadPlan,
    outcome: DownloadOutcome,
    upload: UploadStep,
) {
    let id = writer.id().to_string();
    let artifact = outcome.artifact;
    match &artifact {
        ArtifactResolution::Parsed(_) => {}
        ArtifactResolution::Recovered(path) => ctx.log(
            &id,
            "warn",
            "artifact_recovered",
            serde_json::json!({ "path": path.to_string_lossy() }),
        ),
        ArtifactResolution::Unresolved => ctx.log(
            &id,
            "warn",
            "artifact_unresolved",
            serde_json::json!({ "output_dir": plan.output_dir.to_string_lossy() }),
        ),
    }

    let mut local = artifact.path().map(Path::to_path_buf);
    let mut note = None;
    if upload.auto_upload {
        note = Some(match (&ctx.uploader, local.clone()) {
            (Some(uploader), Some(path)) => {
                writer.update(|job| job.mark_uploading());
                match uploader.upload(&path) {
                    Ok(receipt) => {
                        ctx.log(
                            &id,
                            "info",
                            "upload_completed",
                            serde_json::json!({ "remote_id": receipt.remote_id }),
                        );
                        if upload.delete_after_upload && std::fs::remove_file(&path).is_ok() {
                            local = None;
                        }
                        "Uploaded".to_string()
                    }
                    Err(err) => {
                        ctx.log(
                            &id,
                            "warn",
                            "upload_failed",
                            serde_json::json!({ "error": err.to_string() }),
                        );
                        "Upload Failed".to_string()
                    }
                }
            }
            (None, _) => "Upload skipped: no cloud account configured".to_string(),
            (_, None) => "Upload skipped: no file to upload".to_string(),
        });
    }

    let root = ctx
        .paths
        .effective_download_dir()
        .unwrap_or_else(|_| ctx.paths.default_download_dir());
    let completion = JobCompletion {
        filename: artifact
            .path()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().to_string()),
        download_url: local
            .as_deref()
            .and_then(|p| download_url_for(&root, p).or_else(|| download_url_for(&plan.output_dir, p))),
        artifact_path: local,
        note,
    };
    ctx.log(
        &id,
        "info",
        "job_completed",
        serde_json::json!({
            "filename": completion.filename,
            "accelerated": outcome.accelerated,
            "degraded": artifact.is_degraded(),
        }),
    );
    writer.update(|job| job.complete(completion));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn exit_failure() -> EngineError {
        EngineError::ExternalToolFailed {
            tool: "yt-dlp".to_string(),
            code: Some(1),
            stderr: "HTTP Error 403".to_string(),
        }
    }

    #[test]
    fn without_accelerator_only_one_attempt_is_made() {
        let calls = Cell::new(0);
        let fallbacks = Cell::new(0);
        let result: Result<()> = run_with_fallback(
            None,
            |accel| {
                assert!(accel.is_none());
                calls.set(calls.get() + 1);
                Err(exit_failure())
            },
            |_| fallbacks.set(fallbacks.get() + 1),
        );
        assert!(matches!(result, Err(EngineError::ExternalToolFailed { .. })));
        assert_eq!(calls.get(), 1);
        assert_eq!(fallbacks.get(), 0);
    }

    #[test]
    fn accelerated_exit_failure_is_retried_once_without_accelerator() {
        let seen: std::cell::RefCell<Vec<bool>> = Default::default();
        let result = run_with_fallback(
            Some(Path::new("/tools/aria2c")),
            |accel| {
                seen.borrow_mut().push(accel.is_some());
                if accel.is_some() {
                    Err(exit_failure())
                } else {
                    Ok("plain")
                }
            },
            |err| assert!(err.allows_plain_retry()),
        );
        assert_eq!(result.expect("plain attempt"), "plain");
        assert_eq!(*seen.borrow(), vec![true, false]);
    }

    #[test]
    fn second_failure_is_terminal_and_mentions_both() {
        let calls = Cell::new(0);
        let err = run_with_fallback::<()>(
            Some(Path::new("/tools/aria2c")),
            |_| {
                calls.set(calls.get() + 1);
                Err(exit_failure())
            },
            |_| {},
        )
        .expect_err("both fail");
        assert_eq!(calls.get(), 2);
        let message = err.to_string();
        assert!(matches!(err, EngineError::RetryExhausted { .. }));
        assert!(message.contains("HTTP Error 403"));
    }

    #[test]
    fn spawn_failure_and_cancel_are_never_retried() {
        for first in [
            EngineError::ExternalToolMissing {
                tool: "yt-dlp".to_string(),
            },
            EngineError::Canceled,
        ] {
            let calls = Cell::new(0);
            let mut first = Some(first);
            let _ = run_with_fallback::<()>(
                Some(Path::new("/tools/aria2c")),
                |_| {
                    calls.set(calls.get() + 1);
                    Err(first.take().unwrap_or(EngineError::Canceled))
                },
                |_| panic!("no fallback expected"),
            );
            assert_eq!(calls.get(), 1);
        }
    }

    #[test]
    fn cancel_during_retry_stays_canceled() {
        let err = run_with_fallback::<()>(
            Some(Path::new("/tools/aria2c")),
            |accel| {
                if accel.is_some() {
                    Err(exit_failure())
                } else {
                    Err(EngineError::Canceled)
                }
            },
            |_| {},
        )
        .expect_err("canceled");
        assert!(matches!(err, EngineError::Canceled));
    }

    #[test]
    fn parsed_destination_wins_when_present() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("clip.mp4");
        std::fs::write(&file, b"data").expect("write");

        let resolved = resolve_artifact(
            Some(&file),
            dir.path(),
            SystemTime::now(),
            Duration::from_secs(20),
        );
        assert_eq!(resolved, ArtifactResolution::Parsed(file));
        assert!(!resolved.is_degraded());
    }

    #[test]
    fn recovery_picks_newest_final_file_inside_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = dir.path().join("old.mp4");
        let fresh = dir.path().join("fresh.mp4");
        let partial = dir.path().join("fresh.f137.mp4");
        for path in [&old, &fresh, &partial] {
            std::fs::write(path, b"data").expect("write");
        }
        std::fs::create_dir_all(dir.path().join("temp_job")).expect("temp dir");
        let long_ago =
            filetime::FileTime::from_system_time(SystemTime::now() - Duration::from_secs(600));
        filetime::set_file_mtime(&old, long_ago).expect("backdate");
        let earlier =
            filetime::FileTime::from_system_time(SystemTime::now() - Duration::from_secs(5));
        filetime::set_file_mtime(&fresh, earlier).expect("backdate fresh");

        let resolved = resolve_artifact(
            Some(Path::new("/missing/reported.mp4")),
            dir.path(),
            SystemTime::now(),
            Duration::from_secs(20),
        );
        assert_eq!(resolved, ArtifactResolution::Recovered(fresh));
        assert!(resolved.is_degraded());
    }

    #[test]
    fn nothing_recent_is_unresolved() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = dir.path().join("old.mp4");
        std::fs::write(&old, b"data").expect("write");
        let long_ago =
            filetime::FileTime::from_system_time(SystemTime::now() - Duration::from_secs(600));
        filetime::set_file_mtime(&old, long_ago).expect("backdate");

        let resolved = resolve_artifact(None, dir.path(), SystemTime::now(), Duration::from_secs(20));
        assert_eq!(resolved, ArtifactResolution::Unresolved);
        assert_eq!(resolved.path(), None);
    }

    #[test]
    fn url_validation_accepts_only_web_schemes() {
        assert_eq!(
            validate_url("  https://example.com/watch?v=1 ").expect("valid"),
            "https://example.com/watch?v=1"
        );
        for bad in ["", "not a url", "file:///etc/passwd", "ftp://example.com/x"] {
            let err = validate_url(bad).expect_err(bad);
            assert_eq!(err.http_status(), 400);
        }
    }

    #[test]
    fn filenames_with_separators_are_rejected() {
        assert!(validate_filename(None).is_ok());
        assert!(validate_filename(Some("talk")).is_ok());
        assert!(validate_filename(Some("../escape")).is_err());
        assert!(validate_filename(Some("a/b")).is_err());
    }

    #[test]
    fn download_urls_are_relative_to_served_root() {
        let root = Path::new("/data/downloads");
        assert_eq!(
            download_url_for(root, Path::new("/data/downloads/batch_1/a.mp4")).as_deref(),
            Some("/downloads/batch_1/a.mp4")
        );
        assert_eq!(download_url_for(root, Path::new("/elsewhere/a.mp4")), None);
    }

    #[test]
    fn request_bodies_deserialize_from_camel_case() {
        let request: DownloadRequest = serde_json::from_str(
            r#"{"url":"https://e.com/v","audioOnly":true,"startTime":"0:10","downloadSubtitles":true,"subsLang":"en","autoUpload":true}"#,
        )
        .expect("parse");
        assert!(request.audio_only && request.download_subtitles && request.auto_upload);
        let options = request.options();
        assert_eq!(options.start_time.as_deref(), Some("0:10"));
        assert_eq!(options.subtitle_langs.as_deref(), Some("en"));
        assert!(!request.turbo);
    }
}
