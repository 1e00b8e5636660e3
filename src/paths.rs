use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir().join("settings.json")
    }

    pub fn cloud_tokens_path(&self) -> PathBuf {
        self.config_dir().join("cloud_tokens.json")
    }

    /// Netscape cookie jar handed to yt-dlp when present.
    pub fn cookies_path(&self) -> PathBuf {
        self.config_dir().join("cookies.txt")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn job_logs_dir(&self) -> PathBuf {
        self.logs_dir().join("jobs")
    }

    pub fn job_log_path(&self, id: &str) -> PathBuf {
        self.job_logs_dir().join(format!("{id}.jsonl"))
    }

    pub fn download_dir_override_path(&self) -> PathBuf {
        self.config_dir().join("download_dir.txt")
    }

    pub fn default_download_dir(&self) -> PathBuf {
        self.base_dir.join("downloads")
    }

    pub fn download_dir_override(&self) -> std::io::Result<Option<PathBuf>> {
        let path = self.download_dir_override_path();
        if !path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read_to_string(path)?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        Ok(Some(PathBuf::from(trimmed)))
    }

    pub fn effective_download_dir(&self) -> std::io::Result<PathBuf> {
        if let Some(override_dir) = self.download_dir_override()? {
            return Ok(override_dir);
        }
        Ok(self.default_download_dir())
    }

    pub fn set_download_dir_override(&self, dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::write(
            self.download_dir_override_path(),
            format!("{}\n", dir.to_string_lossy()),
        )?;
        Ok(())
    }

    pub fn batch_dir(&self, batch_id: &str) -> PathBuf {
        self.default_download_dir().join(format!("batch_{batch_id}"))
    }

    pub fn batch_archive_path(&self, batch_id: &str) -> PathBuf {
        self.default_download_dir()
            .join(format!("batch_{batch_id}.zip"))
    }

    /// Scratch directory for one subtitle extraction.
    pub fn subtitle_work_dir(&self, id: &str) -> PathBuf {
        self.default_download_dir().join(format!("temp_subs_{id}"))
    }

    /// Scratch directory for intermediate fragments of one fast download.
    pub fn job_temp_dir(download_dir: &Path, job_id: &str) -> PathBuf {
        download_dir.join(format!("temp_{job_id}"))
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn ytdlp_bundled_path(&self) -> PathBuf {
        let mut path = self.tools_dir().join("yt-dlp").join("yt-dlp");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    pub fn accelerator_bundled_path(&self) -> PathBuf {
        let mut path = self.tools_dir().join("aria2").join("aria2c");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    pub fn ffmpeg_dir(&self) -> PathBuf {
        self.tools_dir().join("ffmpeg")
    }

    pub fn ffmpeg_bin_path(&self) -> PathBuf {
        let mut path = self.ffmpeg_dir().join("ffmpeg");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    pub fn ffprobe_bin_path(&self) -> PathBuf {
        let mut path = self.ffmpeg_dir().join("ffprobe");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    pub fn ffmpeg_cmd(&self) -> PathBuf {
        let path = self.ffmpeg_bin_path();
        if path.exists() {
            path
        } else {
            PathBuf::from("ffmpeg")
        }
    }

    pub fn ffprobe_cmd(&self) -> PathBuf {
        let path = self.ffprobe_bin_path();
        if path.exists() {
            path
        } else {
            PathBuf::from("ffprobe")
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.job_logs_dir())?;
        std::fs::create_dir_all(self.default_download_dir())?;
        std::fs::create_dir_all(self.tools_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_dir_override_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        assert_eq!(
            paths.effective_download_dir().expect("default"),
            paths.default_download_dir()
        );

        let custom = dir.path().join("elsewhere");
        paths.set_download_dir_override(&custom).expect("set");
        assert_eq!(paths.effective_download_dir().expect("override"), custom);
    }

    #[test]
    fn batch_locations_live_under_default_downloads() {
        let paths = AppPaths::new(PathBuf::from("/data"));
        assert_eq!(
            paths.batch_dir("b1"),
            PathBuf::from("/data/downloads/batch_b1")
        );
        assert_eq!(
            paths.batch_archive_path("b1"),
            PathBuf::from("/data/downloads/batch_b1.zip")
        );
        assert_eq!(
            paths.subtitle_work_dir("s1"),
            PathBuf::from("/data/downloads/temp_subs_s1")
        );
    }
}
