use crate::archive::{self, BatchArchive};
use crate::batch::{self, BatchAccepted, BatchController, ParallelDownloadRequest, SweeperHandle};
use crate::config::{self, EngineSettings};
use crate::download::{
    new_id, validate_url, DownloadContext, DownloadRequest, FastDownloadRequest,
    SingleJobController,
};
use crate::ffmpeg::{
    self, AudioFormat, CompressQuality, CompressResult, FfmpegTools, GifOptions, MediaProbe,
    ThumbnailOptions,
};
use crate::job::{BatchSnapshot, Job};
use crate::joblog;
use crate::paths::AppPaths;
use crate::store::{BatchStore, JobStore};
use crate::tools::{self, ToolStatus, ToolsStatus};
use crate::upload::{ArtifactUploader, GoogleDriveUploader};
use crate::ytdlp::{self, MediaInfo, Playlist, SubtitleText, DEFAULT_SUBTITLE_LANG};
use crate::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadAccepted {
    pub download_id: String,
}

/// Transport-agnostic entry point. Each method backs one HTTP route.
pub struct Engine {
    paths: AppPaths,
    settings: Arc<EngineSettings>,
    singles: SingleJobController,
    batches: BatchController,
    sweeper: Option<SweeperHandle>,
}

impl Engine {
    pub fn open(paths: AppPaths) -> Result<Self> {
        paths.ensure_dirs()?;
        let settings = config::load_settings(&paths)?;
        Self::open_with_settings(paths, settings)
    }

    pub fn open_with_settings(paths: AppPaths, settings: EngineSettings) -> Result<Self> {
        paths.ensure_dirs()?;

        let prune_paths = paths.clone();
        thread::spawn(move || {
            let _ = joblog::prune_job_logs(&prune_paths);
        });

        let mut ctx = DownloadContext::new(paths.clone(), settings);
        match GoogleDriveUploader::from_settings(&paths, &ctx.settings.cloud) {
            Ok(Some(uploader)) => {
                let uploader: Arc<dyn ArtifactUploader> = Arc::new(uploader);
                ctx = ctx.with_uploader(uploader);
            }
            Ok(None) => {}
            Err(err) => {
                let _ = joblog::log_line(
                    &paths,
                    "engine",
                    "warn",
                    "uploader_unavailable",
                    serde_json::json!({ "error": err.to_string() }),
                );
            }
        }
        let settings = Arc::clone(&ctx.settings);
        let _ = joblog::log_line(
            &paths,
            "engine",
            "info",
            "engine_opened",
            serde_json::json!({
                "download_dir": paths.default_download_dir().to_string_lossy(),
                "batch_retention_secs": settings.batch_retention_secs,
                "job_log_retention": joblog::job_log_retention_policy(),
            }),
        );

        let batch_store = Arc::new(BatchStore::new("batch"));
        let sweeper = batch::start_sweeper(
            paths.clone(),
            Arc::clone(&batch_store),
            Duration::from_secs(settings.batch_retention_secs),
            Duration::from_secs(settings.sweep_interval_secs),
        )?;

        Ok(Self {
            singles: SingleJobController::new(ctx.clone(), Arc::new(JobStore::new("download"))),
            batches: BatchController::new(ctx, batch_store),
            paths,
            settings,
            sweeper: Some(sweeper),
        })
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// `POST /download`
    pub fn start_download(&self, request: DownloadRequest) -> Result<DownloadAccepted> {
        let download_id = self.singles.start(request)?;
        Ok(DownloadAccepted { download_id })
    }

    /// `POST /download/fast`
    pub fn start_fast_download(&self, request: FastDownloadRequest) -> Result<DownloadAccepted> {
        let download_id = self.singles.start_fast(request)?;
        Ok(DownloadAccepted { download_id })
    }

    /// `GET /progress/:id`
    pub fn progress(&self, id: &str) -> Result<Arc<Job>> {
        self.singles.jobs().require(id)
    }

    pub fn cancel(&self, id: &str) -> Result<bool> {
        self.singles.cancel(id)
    }

    /// `POST /download/parallel`
    pub fn start_parallel(&self, request: ParallelDownloadRequest) -> Result<BatchAccepted> {
        self.batches.start(request)
    }

    /// `GET /progress/batch/:id`
    pub fn batch_progress(&self, id: &str) -> Result<BatchSnapshot> {
        Ok(self.batches.batches().require(id)?.snapshot())
    }

    pub fn cancel_batch(&self, id: &str) -> Result<bool> {
        self.batches.cancel(id)
    }

    /// `POST /download/create-zip`
    pub fn create_batch_zip(&self, id: &str) -> Result<BatchArchive> {
        archive::create_batch_archive(&self.paths, id)
    }

    fn cookies(&self) -> Option<PathBuf> {
        Some(self.paths.cookies_path()).filter(|p| p.is_file())
    }

    /// `GET /info`
    pub fn fetch_info(&self, url: &str) -> Result<MediaInfo> {
        let url = validate_url(url)?;
        ytdlp::fetch_info(
            &tools::resolve_ytdlp(&self.paths, &self.settings),
            &url,
            self.cookies().as_deref(),
        )
    }

    /// `GET /playlist`
    pub fn fetch_playlist(&self, url: &str) -> Result<Playlist> {
        let url = validate_url(url)?;
        ytdlp::fetch_playlist(
            &tools::resolve_ytdlp(&self.paths, &self.settings),
            &url,
            self.cookies().as_deref(),
        )
    }

    /// `POST /extract/subtitles`. `None` when the media has no track in `lang`.
    pub fn extract_subtitles(&self, url: &str, lang: Option<&str>) -> Result<Option<SubtitleText>> {
        let url = validate_url(url)?;
        let lang = lang
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(DEFAULT_SUBTITLE_LANG);
        ytdlp::extract_subtitles(
            &tools::resolve_ytdlp(&self.paths, &self.settings),
            &url,
            lang,
            &self.paths.subtitle_work_dir(&new_id()),
            self.cookies().as_deref(),
        )
    }

    /// `GET /check`
    pub fn tools_status(&self) -> ToolsStatus {
        tools::tools_status(&self.paths, &self.settings)
    }

    pub fn install_ffmpeg(&self) -> Result<ToolStatus> {
        tools::install_ffmpeg_tools(&self.paths)
    }

    pub fn install_ytdlp(&self) -> Result<ToolStatus> {
        tools::install_ytdlp(&self.paths)
    }

    fn ffmpeg(&self) -> FfmpegTools {
        FfmpegTools::resolve(&self.paths, &self.settings)
    }

    pub fn probe_media(&self, input: &Path) -> Result<MediaProbe> {
        ffmpeg::probe(&self.ffmpeg(), input)
    }

    pub fn convert_to_gif(&self, input: &Path, options: GifOptions) -> Result<PathBuf> {
        ffmpeg::convert_to_gif(&self.ffmpeg(), input, options)
    }

    pub fn compress_video(&self, input: &Path, quality: CompressQuality) -> Result<CompressResult> {
        ffmpeg::compress_video(&self.ffmpeg(), input, quality)
    }

    pub fn extract_audio(
        &self,
        input: &Path,
        format: AudioFormat,
        bitrate: Option<&str>,
    ) -> Result<PathBuf> {
        ffmpeg::extract_audio(&self.ffmpeg(), input, format, bitrate)
    }

    pub fn generate_thumbnail(&self, input: &Path, options: ThumbnailOptions) -> Result<PathBuf> {
        ffmpeg::generate_thumbnail(&self.ffmpeg(), input, options)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(mut sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineError;

    fn engine(dir: &Path) -> Engine {
        Engine::open(AppPaths::new(dir.to_path_buf())).expect("open")
    }

    #[test]
    fn open_creates_layout_and_unknown_ids_are_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(dir.path());
        assert!(engine.paths().default_download_dir().is_dir());
        assert!(engine.paths().job_logs_dir().is_dir());

        assert_eq!(engine.progress("missing").expect_err("job").http_status(), 404);
        assert_eq!(
            engine.batch_progress("missing").expect_err("batch").http_status(),
            404
        );
        assert_eq!(engine.cancel("missing").expect_err("cancel").http_status(), 404);
    }

    #[test]
    fn invalid_requests_are_rejected_before_any_job_exists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(dir.path());
        let err = engine
            .start_download(DownloadRequest {
                url: "ftp://example.com/x".to_string(),
                ..DownloadRequest::default()
            })
            .expect_err("scheme");
        assert!(matches!(err, EngineError::InvalidRequest(_)));
        assert!(engine.fetch_info("").is_err());
        assert!(matches!(
            engine.fetch_playlist("not a url"),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.extract_subtitles("file:///etc/passwd", None),
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn open_logs_retention_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(dir.path());
        let log = std::fs::read_to_string(engine.paths().job_log_path("engine")).expect("log");
        let opened: serde_json::Value = log
            .lines()
            .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
            .find(|v| v["event"] == "engine_opened")
            .expect("engine_opened record");
        assert_eq!(
            opened["data"]["job_log_retention"]["max_backups"],
            serde_json::json!(3)
        );
        assert_eq!(
            opened["data"]["batch_retention_secs"],
            serde_json::json!(engine.settings().batch_retention_secs)
        );
    }

    #[test]
    fn accepted_download_serializes_as_download_id() {
        let json = serde_json::to_value(DownloadAccepted {
            download_id: "abc".to_string(),
        })
        .expect("json");
        assert_eq!(json, serde_json::json!({ "downloadId": "abc" }));
    }

    #[test]
    fn zip_of_unknown_batch_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(dir.path());
        assert_eq!(
            engine.create_batch_zip("nope").expect_err("zip").http_status(),
            404
        );
    }

    #[test]
    fn bad_settings_fail_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.config_dir()).expect("dir");
        std::fs::write(paths.settings_path(), "{ not json").expect("write");
        assert!(matches!(
            Engine::open(paths),
            Err(EngineError::InvalidConfig(_))
        ));
    }
}
