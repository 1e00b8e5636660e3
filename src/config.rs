use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Hard ceiling on concurrently running extraction processes within one batch.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 5;
pub const DEFAULT_ACCELERATOR_ARGS: &str = "-x 16 -k 1M -s 16";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub max_concurrent_downloads: usize,
    pub batch_retention_secs: u64,
    pub sweep_interval_secs: u64,
    /// 0 disables the timeout.
    pub download_timeout_secs: u64,
    pub artifact_recovery_window_secs: u64,
    pub tools: ToolSettings,
    pub cloud: CloudSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            batch_retention_secs: 60 * 60,
            sweep_interval_secs: 60 * 60,
            download_timeout_secs: 2 * 60 * 60,
            artifact_recovery_window_secs: 20,
            tools: ToolSettings::default(),
            cloud: CloudSettings::default(),
        }
    }
}

impl EngineSettings {
    pub fn clamp_concurrency(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.max_concurrent_downloads)
            .clamp(1, MAX_CONCURRENT_DOWNLOADS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    /// Explicit extraction tool executable; bundled copy and PATH are used otherwise.
    pub ytdlp_path: Option<String>,
    /// Arguments placed before every extraction invocation (e.g. `-m yt_dlp`).
    pub ytdlp_prefix_args: Vec<String>,
    pub accelerator_path: Option<String>,
    pub accelerator_args: String,
    pub ffmpeg_path: Option<String>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            ytdlp_path: None,
            ytdlp_prefix_args: Vec::new(),
            accelerator_path: None,
            accelerator_args: DEFAULT_ACCELERATOR_ARGS.to_string(),
            ffmpeg_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

pub fn load_settings(paths: &AppPaths) -> Result<EngineSettings> {
    let path = paths.settings_path();
    if !path.exists() {
        return Ok(EngineSettings::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: EngineSettings = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::InvalidConfig(format!(
            "failed to parse settings at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_settings(paths: &AppPaths, settings: &EngineSettings) -> Result<()> {
    let path = paths.settings_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_settings_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let settings = load_settings(&paths).expect("load");
        assert_eq!(settings.max_concurrent_downloads, 3);
        assert_eq!(settings.artifact_recovery_window_secs, 20);
        assert_eq!(settings.tools.accelerator_args, DEFAULT_ACCELERATOR_ARGS);
    }

    #[test]
    fn partial_settings_fill_in_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.config_dir()).expect("config dir");
        std::fs::write(
            paths.settings_path(),
            r#"{"max_concurrent_downloads": 4, "tools": {"ytdlp_path": "/opt/yt-dlp"}}"#,
        )
        .expect("write");

        let settings = load_settings(&paths).expect("load");
        assert_eq!(settings.max_concurrent_downloads, 4);
        assert_eq!(settings.tools.ytdlp_path.as_deref(), Some("/opt/yt-dlp"));
        assert_eq!(settings.batch_retention_secs, 3600);
    }

    #[test]
    fn malformed_settings_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.config_dir()).expect("config dir");
        std::fs::write(paths.settings_path(), "{not json").expect("write");
        let err = load_settings(&paths).expect_err("must fail");
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn save_then_load_keeps_tool_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let mut settings = EngineSettings::default();
        settings.tools.ytdlp_prefix_args = vec!["-m".to_string(), "yt_dlp".to_string()];
        save_settings(&paths, &settings).expect("save");
        let loaded = load_settings(&paths).expect("load");
        assert_eq!(loaded.tools.ytdlp_prefix_args, vec!["-m", "yt_dlp"]);
    }

    #[test]
    fn concurrency_is_clamped_to_hard_ceiling() {
        let settings = EngineSettings::default();
        assert_eq!(settings.clamp_concurrency(None), 3);
        assert_eq!(settings.clamp_concurrency(Some(0)), 1);
        assert_eq!(settings.clamp_concurrency(Some(50)), MAX_CONCURRENT_DOWNLOADS);
    }
}
