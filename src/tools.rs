use crate::config::EngineSettings;
use crate::paths::AppPaths;
use crate::process::ProcessSpec;
use crate::{EngineError, Result};
use serde::Serialize;
use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};

const YTDLP_MIN_DOWNLOAD_BYTES: u64 = 512 * 1024;

/// Launcher for the extraction tool: a program plus arguments placed before every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub prefix_args: Vec<String>,
}

impl ToolCommand {
    pub fn process_spec(&self, args: &[String]) -> ProcessSpec {
        ProcessSpec::new("yt-dlp", self.program.clone())
            .args(self.prefix_args.iter().cloned())
            .args(args.iter().cloned())
    }
}

/// Settings override, then the bundled copy, then `yt-dlp` on PATH.
pub fn resolve_ytdlp(paths: &AppPaths, settings: &EngineSettings) -> ToolCommand {
    let prefix_args = settings.tools.ytdlp_prefix_args.clone();
    if let Some(configured) = non_empty(settings.tools.ytdlp_path.as_deref()) {
        return ToolCommand {
            program: PathBuf::from(configured),
            prefix_args,
        };
    }

    let bundled = paths.ytdlp_bundled_path();
    let program = if bundled.exists() {
        bundled
    } else {
        PathBuf::from("yt-dlp")
    };
    ToolCommand {
        program,
        prefix_args,
    }
}

/// The accelerator is optional and detected by presence on disk only.
pub fn accelerator_path(paths: &AppPaths, settings: &EngineSettings) -> Option<PathBuf> {
    if let Some(configured) = non_empty(settings.tools.accelerator_path.as_deref()) {
        let configured = PathBuf::from(configured);
        return configured.is_file().then_some(configured);
    }

    let bundled = paths.accelerator_bundled_path();
    if bundled.is_file() {
        return Some(bundled);
    }
    find_on_path("aria2c")
}

pub fn ffmpeg_program(paths: &AppPaths, settings: &EngineSettings) -> PathBuf {
    match non_empty(settings.tools.ffmpeg_path.as_deref()) {
        Some(configured) => PathBuf::from(configured),
        None => paths.ffmpeg_cmd(),
    }
}

/// Explicit ffmpeg location handed to yt-dlp; `None` lets yt-dlp search PATH itself.
pub fn ffmpeg_location(paths: &AppPaths, settings: &EngineSettings) -> Option<PathBuf> {
    if let Some(configured) = non_empty(settings.tools.ffmpeg_path.as_deref()) {
        return Some(PathBuf::from(configured));
    }
    let bundled = paths.ffmpeg_bin_path();
    bundled.exists().then_some(bundled)
}

pub fn find_on_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    let names: Vec<String> = if cfg!(windows) {
        vec![format!("{name}.exe"), name.to_string()]
    } else {
        vec![name.to_string()]
    };
    std::env::split_paths(&path_var)
        .flat_map(|dir| names.iter().map(move |n| dir.join(n)))
        .find(|candidate| candidate.is_file())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub available: bool,
    pub path: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolsStatus {
    pub ytdlp: ToolStatus,
    pub ffmpeg: ToolStatus,
    pub accelerator: ToolStatus,
    pub ready: bool,
    pub message: String,
}

pub fn tools_status(paths: &AppPaths, settings: &EngineSettings) -> ToolsStatus {
    let ytdlp_cmd = resolve_ytdlp(paths, settings);
    let ytdlp_version = tool_version_first_line(
        &ytdlp_cmd.program,
        ytdlp_cmd
            .prefix_args
            .iter()
            .map(String::as_str)
            .chain(["--version"]),
    );
    let ytdlp = ToolStatus {
        available: ytdlp_version.is_some(),
        path: ytdlp_cmd.program.to_string_lossy().to_string(),
        version: ytdlp_version,
    };

    let ffmpeg_cmd = ffmpeg_program(paths, settings);
    let ffmpeg_version = tool_version_first_line(&ffmpeg_cmd, ["-version"]);
    let ffmpeg = ToolStatus {
        available: ffmpeg_version.is_some(),
        path: ffmpeg_cmd.to_string_lossy().to_string(),
        version: ffmpeg_version,
    };

    let accelerator = match accelerator_path(paths, settings) {
        Some(path) => ToolStatus {
            available: true,
            version: tool_version_first_line(&path, ["--version"]),
            path: path.to_string_lossy().to_string(),
        },
        None => ToolStatus {
            available: false,
            path: String::new(),
            version: None,
        },
    };

    let message = if !ytdlp.available {
        "yt-dlp is not installed"
    } else if !ffmpeg.available {
        "ffmpeg is not installed (required for trimming and conversion)"
    } else {
        "ready"
    };

    ToolsStatus {
        ready: ytdlp.available && ffmpeg.available,
        message: message.to_string(),
        ytdlp,
        ffmpeg,
        accelerator,
    }
}

fn tool_version_first_line<I, S>(program: &Path, args: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = crate::process::command(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(first.to_string())
}

pub fn install_ffmpeg_tools(paths: &AppPaths) -> Result<ToolStatus> {
    paths.ensure_dirs()?;

    let destination = paths.ffmpeg_dir();
    std::fs::create_dir_all(&destination)?;

    let download_url = ffmpeg_sidecar::download::ffmpeg_download_url()
        .map_err(|e| EngineError::InstallFailed(e.to_string()))?;
    let archive_path =
        ffmpeg_sidecar::download::download_ffmpeg_package(download_url, &destination)
            .map_err(|e| EngineError::InstallFailed(e.to_string()))?;
    ffmpeg_sidecar::download::unpack_ffmpeg(&archive_path, &destination)
        .map_err(|e| EngineError::InstallFailed(e.to_string()))?;

    let ffmpeg = paths.ffmpeg_bin_path();
    Ok(ToolStatus {
        available: ffmpeg.exists(),
        version: tool_version_first_line(&ffmpeg, ["-version"]),
        path: ffmpeg.to_string_lossy().to_string(),
    })
}

fn ytdlp_release_url() -> &'static str {
    if cfg!(windows) {
        "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp.exe"
    } else if cfg!(target_os = "macos") {
        "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_macos"
    } else {
        "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_linux"
    }
}

/// Downloads the standalone yt-dlp release into the bundled tool location.
pub fn install_ytdlp(paths: &AppPaths) -> Result<ToolStatus> {
    paths.ensure_dirs()?;

    let destination = paths.ytdlp_bundled_path();
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = destination.with_extension("download");

    let resp = ureq::get(ytdlp_release_url())
        .call()
        .map_err(|e| EngineError::InstallFailed(format!("yt-dlp download failed: {e}")))?;
    let status = resp.status();
    if status.as_u16() >= 400 {
        return Err(EngineError::InstallFailed(format!(
            "yt-dlp download failed (status={status})"
        )));
    }

    {
        let mut reader = resp.into_body().into_reader();
        let mut file = std::fs::File::create(&tmp_path)?;
        std::io::copy(&mut reader, &mut file)?;
        file.flush()?;
    }

    let downloaded_size = std::fs::metadata(&tmp_path).map(|m| m.len()).unwrap_or(0);
    if downloaded_size < YTDLP_MIN_DOWNLOAD_BYTES {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(EngineError::InstallFailed(
            "downloaded yt-dlp is unexpectedly small".to_string(),
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o755))?;
    }

    if destination.exists() {
        let _ = std::fs::remove_file(&destination);
    }
    if std::fs::rename(&tmp_path, &destination).is_err() {
        std::fs::copy(&tmp_path, &destination)?;
        let _ = std::fs::remove_file(&tmp_path);
    }

    Ok(ToolStatus {
        available: true,
        version: tool_version_first_line(&destination, ["--version"]),
        path: destination.to_string_lossy().to_string(),
    })
}
