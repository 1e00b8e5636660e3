use crate::process::{capture_output, ProcessExit, RunControl};
use crate::tools::ToolCommand;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SUBTITLE_LANGS: &str = "ar,en";
/// Language asked for when a subtitle extraction names none.
pub const DEFAULT_SUBTITLE_LANG: &str = "ar";
const SUBTITLE_FORMATS: &str = "srt/vtt/best";
const SUBTITLE_EXTENSIONS: [&str; 2] = ["srt", "vtt"];
const DEFAULT_OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
const EXT_PLACEHOLDER: &str = ".%(ext)s";
const FAST_VIDEO_SELECTOR: &str = "bestvideo*+bestaudio/bestvideo+bestaudio/best";
const MERGED_VIDEO_SELECTOR: &str = "bestvideo+bestaudio/best";
const INFO_TIMEOUT_SECS: u64 = 120;
const PLAYLIST_TIMEOUT_SECS: u64 = 600;
const SUBTITLE_TIMEOUT_SECS: u64 = 300;
const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

/// Which argument set a download uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadProfile {
    /// Full option set: trimming, subtitles, metadata, custom filename, remux.
    Standard,
    /// Per-job temp path, keeps going past fragment errors.
    Fast,
    /// Restricted filenames inside a batch directory.
    BatchItem,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadOptions {
    pub quality: Option<String>,
    pub format: Option<String>,
    pub audio_only: bool,
    pub filename: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub subtitles: bool,
    pub subtitle_langs: Option<String>,
    pub embed_metadata: bool,
}

impl DownloadOptions {
    fn wants_audio(&self) -> bool {
        self.audio_only || self.format.as_deref() == Some("audio")
    }

    fn audio_format(&self) -> &str {
        match self.format.as_deref().map(str::trim) {
            None | Some("") | Some("audio") | Some("best") | Some("video") => "mp3",
            Some(other) => other,
        }
    }

    /// Container all video jobs are merged into.
    fn video_container(&self) -> &str {
        match self.format.as_deref().map(str::trim) {
            None | Some("") | Some("best") | Some("video") => "mp4",
            Some(other) => other,
        }
    }

    fn quality(&self) -> Option<&str> {
        self.quality.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }
}

/// Where output goes and which optional files are passed along.
#[derive(Debug, Clone, Default)]
pub struct OutputLayout {
    pub output_dir: PathBuf,
    pub temp_dir: Option<PathBuf>,
    pub cookies: Option<PathBuf>,
    pub ffmpeg_location: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl TrimRange {
    /// Empty, `00:00` and `0:00` bounds count as absent. `None` when neither bound remains.
    pub fn from_bounds(start: Option<&str>, end: Option<&str>) -> Option<Self> {
        let start = meaningful_time(start);
        let end = meaningful_time(end);
        if start.is_none() && end.is_none() {
            return None;
        }
        Some(Self { start, end })
    }

    pub fn section_arg(&self) -> String {
        match (&self.start, &self.end) {
            (Some(start), Some(end)) => format!("*{start}-{end}"),
            (Some(start), None) => format!("*{start}-inf"),
            (None, Some(end)) => format!("*0:00-{end}"),
            (None, None) => "*".to_string(),
        }
    }

    /// Keeps trimmed output from overwriting the untrimmed file.
    pub fn filename_suffix(&self) -> String {
        let clean = |t: &str| t.replace(':', "-");
        match (&self.start, &self.end) {
            (Some(start), Some(end)) => format!("_cut_{}_to_{}", clean(start), clean(end)),
            (Some(start), None) => format!("_cut_from_{}", clean(start)),
            (None, Some(end)) => format!("_cut_until_{}", clean(end)),
            (None, None) => "_cut".to_string(),
        }
    }
}

fn meaningful_time(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|t| !t.is_empty() && *t != "00:00" && *t != "0:00")
        .map(str::to_string)
}

pub fn output_template(options: &DownloadOptions, trim: Option<&TrimRange>) -> String {
    let mut template = match options.filename.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() && name.contains('.') => name.to_string(),
        Some(name) if !name.is_empty() => format!("{name}{EXT_PLACEHOLDER}"),
        _ => DEFAULT_OUTPUT_TEMPLATE.to_string(),
    };
    if let Some(trim) = trim {
        let suffix = trim.filename_suffix();
        if template.contains(EXT_PLACEHOLDER) {
            template = template.replace(EXT_PLACEHOLDER, &format!("{suffix}{EXT_PLACEHOLDER}"));
        } else {
            template.push_str(&suffix);
        }
    }
    template
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn push_pair(args: &mut Vec<String>, flag: &str, value: impl Into<String>) {
    args.push(flag.to_string());
    args.push(value.into());
}

/// Builds the full argument list for one download, URL last. Accelerator flags are
/// added per attempt by [`with_accelerator`].
pub fn build_download_args(
    profile: DownloadProfile,
    options: &DownloadOptions,
    layout: &OutputLayout,
    url: &str,
) -> Vec<String> {
    let mut args: Vec<String> = ["--newline", "--progress", "--no-warnings"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    match profile {
        DownloadProfile::Standard => standard_args(&mut args, options, layout),
        DownloadProfile::Fast => fast_args(&mut args, options, layout),
        DownloadProfile::BatchItem => batch_item_args(&mut args, options, layout),
    }

    if let Some(cookies) = &layout.cookies {
        push_pair(&mut args, "--cookies", path_arg(cookies));
    }
    if profile != DownloadProfile::Fast {
        if let Some(ffmpeg) = &layout.ffmpeg_location {
            push_pair(&mut args, "--ffmpeg-location", path_arg(ffmpeg));
        }
    }

    args.push(url.to_string());
    args
}

fn standard_args(args: &mut Vec<String>, options: &DownloadOptions, layout: &OutputLayout) {
    let trim = TrimRange::from_bounds(options.start_time.as_deref(), options.end_time.as_deref());
    let template = output_template(options, trim.as_ref());
    args.push("--windows-filenames".to_string());
    push_pair(args, "-o", path_arg(&layout.output_dir.join(template)));

    if options.audio_only {
        args.push("-x".to_string());
        push_pair(args, "--audio-format", options.audio_format());
        push_pair(args, "--audio-quality", "0");
    } else {
        let selector = match options.quality() {
            Some(q) if q.contains("bestvideo") => q.to_string(),
            None | Some("best") => MERGED_VIDEO_SELECTOR.to_string(),
            Some(q) => q.to_string(),
        };
        push_pair(args, "-f", selector);
        let container = options.video_container();
        push_pair(args, "--merge-output-format", container);
        push_pair(args, "--remux-video", container);
    }

    if let Some(trim) = &trim {
        push_pair(args, "--download-sections", trim.section_arg());
        args.push("--force-keyframes-at-cuts".to_string());
    }

    if options.subtitles {
        args.push("--write-subs".to_string());
        let langs = options
            .subtitle_langs
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(DEFAULT_SUBTITLE_LANGS);
        push_pair(args, "--sub-lang", langs);
    }

    if options.embed_metadata {
        args.push("--embed-metadata".to_string());
    }
}

fn fast_args(args: &mut Vec<String>, options: &DownloadOptions, layout: &OutputLayout) {
    args.push("--no-abort-on-error".to_string());
    if let Some(temp) = &layout.temp_dir {
        push_pair(args, "--paths", format!("temp:{}", path_arg(temp)));
    }
    if let Some(ffmpeg) = &layout.ffmpeg_location {
        push_pair(args, "--ffmpeg-location", path_arg(ffmpeg));
    }
    push_pair(
        args,
        "-o",
        path_arg(&layout.output_dir.join(DEFAULT_OUTPUT_TEMPLATE)),
    );

    if options.wants_audio() {
        push_pair(args, "-f", "bestaudio/best");
        args.push("-x".to_string());
        push_pair(args, "--audio-format", "mp3");
    } else {
        let selector = match options.quality() {
            Some(q) if q != "best" => q,
            _ => FAST_VIDEO_SELECTOR,
        };
        push_pair(args, "-f", selector);
        push_pair(args, "--merge-output-format", "mp4");
    }
}

fn batch_item_args(args: &mut Vec<String>, options: &DownloadOptions, layout: &OutputLayout) {
    args.push("--restrict-filenames".to_string());
    push_pair(
        args,
        "-o",
        path_arg(&layout.output_dir.join(DEFAULT_OUTPUT_TEMPLATE)),
    );

    if options.wants_audio() {
        args.push("-x".to_string());
        push_pair(args, "--audio-format", "mp3");
        push_pair(args, "--audio-quality", "0");
    } else {
        push_pair(args, "-f", options.quality().unwrap_or("best"));
        push_pair(args, "--merge-output-format", options.video_container());
    }
}

/// Prepends the external downloader flags. The URL stays last.
pub fn with_accelerator(args: &[String], accelerator: &Path, accelerator_args: &str) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len() + 4);
    push_pair(&mut out, "--external-downloader", path_arg(accelerator));
    push_pair(&mut out, "--external-downloader-args", accelerator_args);
    out.extend(args.iter().cloned());
    out
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaFormat {
    pub format_id: String,
    pub ext: Option<String>,
    pub format_note: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub tbr: Option<f64>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
}

impl MediaFormat {
    pub fn has_video(&self) -> bool {
        self.vcodec.as_deref().is_some_and(|c| c != "none")
    }

    pub fn has_audio(&self) -> bool {
        self.acodec.as_deref().is_some_and(|c| c != "none")
    }

    pub fn approx_size(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }
}

/// Metadata printed by `--dump-json`. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaInfo {
    pub id: String,
    pub title: String,
    pub uploader: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub webpage_url: Option<String>,
    pub extractor: Option<String>,
    pub view_count: Option<u64>,
    pub upload_date: Option<String>,
    pub formats: Vec<MediaFormat>,
}

impl MediaInfo {
    /// Distinct video heights, highest first.
    pub fn video_heights(&self) -> Vec<u32> {
        let mut heights: Vec<u32> = self
            .formats
            .iter()
            .filter(|f| f.has_video())
            .filter_map(|f| f.height)
            .collect();
        heights.sort_unstable_by(|a, b| b.cmp(a));
        heights.dedup();
        heights
    }
}

pub fn parse_media_info(stdout: &str) -> Result<MediaInfo> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with('{'))
        .ok_or_else(|| EngineError::Upstream("yt-dlp printed no metadata".to_string()))?;
    serde_json::from_str(line)
        .map_err(|e| EngineError::Upstream(format!("yt-dlp printed unreadable metadata: {e}")))
}

pub fn fetch_info(ytdlp: &ToolCommand, url: &str, cookies: Option<&Path>) -> Result<MediaInfo> {
    let mut args: Vec<String> = vec![
        "--dump-json".to_string(),
        "--no-warnings".to_string(),
        "--no-playlist".to_string(),
    ];
    if let Some(cookies) = cookies {
        push_pair(&mut args, "--cookies", path_arg(cookies));
    }
    args.push(url.to_string());

    let (stdout, exit) = run_capture(ytdlp, &args, INFO_TIMEOUT_SECS)?;
    exit.ensure_success("yt-dlp")?;
    parse_media_info(&stdout)
}

fn run_capture(ytdlp: &ToolCommand, args: &[String], timeout_secs: u64) -> Result<(String, ProcessExit)> {
    let spec = ytdlp.process_spec(args);
    capture_output(
        &spec,
        RunControl {
            cancel: None,
            timeout: Some(Duration::from_secs(timeout_secs)),
        },
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FlatThumbnail {
    url: Option<String>,
}

/// One line of `--flat-playlist --dump-json`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FlatEntry {
    id: String,
    url: Option<String>,
    title: Option<String>,
    thumbnail: Option<String>,
    thumbnails: Vec<FlatThumbnail>,
    duration: Option<f64>,
    duration_string: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaylistEntry {
    pub url: String,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub duration: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Playlist {
    pub videos: Vec<PlaylistEntry>,
    pub count: usize,
}

/// `h:mm:ss`, or `m:ss` under an hour. Missing or zero durations read `0:00`.
pub fn format_duration(seconds: Option<f64>) -> String {
    let total = match seconds {
        Some(s) if s.is_finite() && s >= 1.0 => s as u64,
        _ => return "0:00".to_string(),
    };
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

/// Lines that are not entry objects are skipped, as are entries with neither url nor id.
pub fn parse_playlist(stdout: &str) -> Playlist {
    let videos: Vec<PlaylistEntry> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .filter_map(|l| serde_json::from_str::<FlatEntry>(l).ok())
        .filter_map(|entry| {
            let url = match entry.url.filter(|u| !u.trim().is_empty()) {
                Some(url) => url,
                None if !entry.id.is_empty() => format!("{WATCH_URL_PREFIX}{}", entry.id),
                None => return None,
            };
            let thumbnail = entry
                .thumbnail
                .or_else(|| entry.thumbnails.into_iter().find_map(|t| t.url));
            let duration = entry
                .duration_string
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| format_duration(entry.duration));
            Some(PlaylistEntry {
                url,
                title: entry.title,
                thumbnail,
                duration,
            })
        })
        .collect();
    Playlist {
        count: videos.len(),
        videos,
    }
}

/// Lists a playlist without resolving each entry. A failed run is an error only when it
/// printed nothing.
pub fn fetch_playlist(ytdlp: &ToolCommand, url: &str, cookies: Option<&Path>) -> Result<Playlist> {
    let mut args: Vec<String> = vec![
        "--flat-playlist".to_string(),
        "--dump-json".to_string(),
        "--no-warnings".to_string(),
    ];
    if let Some(cookies) = cookies {
        push_pair(&mut args, "--cookies", path_arg(cookies));
    }
    args.push(url.to_string());

    let (stdout, exit) = run_capture(ytdlp, &args, PLAYLIST_TIMEOUT_SECS)?;
    if stdout.trim().is_empty() {
        exit.ensure_success("yt-dlp")?;
    }
    Ok(parse_playlist(&stdout))
}

#[derive(Debug, Clone, Serialize)]
pub struct SubtitleText {
    pub language: String,
    /// File extension of the track, `srt` or `vtt`.
    pub format: String,
    pub subtitles: String,
}

/// Flags for a subtitle-only run, URL excluded. `auto` or an empty language asks for both
/// default languages.
pub fn subtitle_args(lang: &str, work_dir: &Path) -> Vec<String> {
    let langs = match lang.trim() {
        "" | "auto" => DEFAULT_SUBTITLE_LANGS,
        other => other,
    };
    let mut args: Vec<String> = ["--skip-download", "--write-subs", "--write-auto-subs"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    push_pair(&mut args, "--sub-lang", langs);
    push_pair(&mut args, "--sub-format", SUBTITLE_FORMATS);
    push_pair(&mut args, "--convert-subs", "srt");
    push_pair(&mut args, "-o", path_arg(&work_dir.join(DEFAULT_OUTPUT_TEMPLATE)));
    args
}

/// Writes the tracks into `work_dir`, returns the first one and removes `work_dir`.
/// `None` when the media has no subtitles in the requested languages.
pub fn extract_subtitles(
    ytdlp: &ToolCommand,
    url: &str,
    lang: &str,
    work_dir: &Path,
    cookies: Option<&Path>,
) -> Result<Option<SubtitleText>> {
    std::fs::create_dir_all(work_dir)?;
    let result = run_subtitle_extraction(ytdlp, url, lang, work_dir, cookies);
    let _ = std::fs::remove_dir_all(work_dir);
    result
}

fn run_subtitle_extraction(
    ytdlp: &ToolCommand,
    url: &str,
    lang: &str,
    work_dir: &Path,
    cookies: Option<&Path>,
) -> Result<Option<SubtitleText>> {
    let mut args = subtitle_args(lang, work_dir);
    if let Some(cookies) = cookies {
        push_pair(&mut args, "--cookies", path_arg(cookies));
    }
    args.push(url.to_string());
    let (_, exit) = run_capture(ytdlp, &args, SUBTITLE_TIMEOUT_SECS)?;

    let Some(track) = find_subtitle_file(work_dir)? else {
        exit.ensure_success("yt-dlp")?;
        return Ok(None);
    };
    let bytes = std::fs::read(&track)?;
    let format = track
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    // `<title>.<lang>.<ext>`
    let language = track
        .file_stem()
        .and_then(|stem| Path::new(stem).extension())
        .map(|l| l.to_string_lossy().to_string())
        .unwrap_or_else(|| lang.to_string());
    Ok(Some(SubtitleText {
        language,
        format,
        subtitles: String::from_utf8_lossy(&bytes).to_string(),
    }))
}

/// Prefers `srt` over `vtt`; names are sorted so the pick is stable.
fn find_subtitle_file(dir: &Path) -> Result<Option<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    for wanted in SUBTITLE_EXTENSIONS {
        let hit = files.iter().find(|p| {
            p.extension()
                .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case(wanted))
        });
        if let Some(hit) = hit {
            return Ok(Some(hit.clone()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> OutputLayout {
        OutputLayout {
            output_dir: PathBuf::from("/dl"),
            ..OutputLayout::default()
        }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn standard_video_merges_and_remuxes_to_mp4() {
        let args = build_download_args(
            DownloadProfile::Standard,
            &DownloadOptions::default(),
            &layout(),
            "https://example.com/v",
        );
        assert_eq!(
            args,
            strings(&[
                "--newline",
                "--progress",
                "--no-warnings",
                "--windows-filenames",
                "-o",
                "/dl/%(title)s.%(ext)s",
                "-f",
                "bestvideo+bestaudio/best",
                "--merge-output-format",
                "mp4",
                "--remux-video",
                "mp4",
                "https://example.com/v",
            ])
        );
    }

    #[test]
    fn standard_options_add_trim_subtitles_and_metadata() {
        let options = DownloadOptions {
            quality: Some("bestvideo[height<=720]+bestaudio".into()),
            format: Some("mkv".into()),
            start_time: Some("1:30".into()),
            end_time: Some("2:45".into()),
            subtitles: true,
            embed_metadata: true,
            ..DownloadOptions::default()
        };
        let mut out = layout();
        out.cookies = Some(PathBuf::from("/cfg/cookies.txt"));
        let args = build_download_args(DownloadProfile::Standard, &options, &out, "u");

        let joined = args.join(" ");
        assert!(joined.contains("-o /dl/%(title)s_cut_1-30_to_2-45.%(ext)s"));
        assert!(joined.contains("-f bestvideo[height<=720]+bestaudio"));
        assert!(joined.contains("--merge-output-format mkv --remux-video mkv"));
        assert!(joined.contains("--download-sections *1:30-2:45 --force-keyframes-at-cuts"));
        assert!(joined.contains("--write-subs --sub-lang ar,en"));
        assert!(joined.contains("--embed-metadata"));
        assert!(joined.contains("--cookies /cfg/cookies.txt"));
        assert_eq!(args.last().map(String::as_str), Some("u"));
    }

    #[test]
    fn trim_bounds_ignore_zero_values() {
        assert_eq!(TrimRange::from_bounds(Some("00:00"), Some(" ")), None);

        let from = TrimRange::from_bounds(Some("0:10"), Some("0:00")).expect("start only");
        assert_eq!(from.section_arg(), "*0:10-inf");
        assert_eq!(from.filename_suffix(), "_cut_from_0-10");

        let until = TrimRange::from_bounds(None, Some("1:00:00")).expect("end only");
        assert_eq!(until.section_arg(), "*0:00-1:00:00");
        assert_eq!(until.filename_suffix(), "_cut_until_1-00-00");
    }

    #[test]
    fn custom_filename_keeps_suffix_before_extension() {
        let trim = TrimRange::from_bounds(Some("0:05"), None);
        let named = DownloadOptions {
            filename: Some("talk".into()),
            ..DownloadOptions::default()
        };
        assert_eq!(
            output_template(&named, trim.as_ref()),
            "talk_cut_from_0-05.%(ext)s"
        );

        let with_ext = DownloadOptions {
            filename: Some("talk.mp4".into()),
            ..DownloadOptions::default()
        };
        assert_eq!(output_template(&with_ext, None), "talk.mp4");
        assert_eq!(
            output_template(&with_ext, trim.as_ref()),
            "talk.mp4_cut_from_0-05"
        );
    }

    #[test]
    fn standard_audio_extracts_requested_format() {
        let options = DownloadOptions {
            audio_only: true,
            format: Some("m4a".into()),
            ..DownloadOptions::default()
        };
        let args = build_download_args(DownloadProfile::Standard, &options, &layout(), "u");
        let joined = args.join(" ");
        assert!(joined.contains("-x --audio-format m4a --audio-quality 0"));
        assert!(!joined.contains("--merge-output-format"));
    }

    #[test]
    fn fast_profile_uses_temp_path_and_flexible_selector() {
        let out = OutputLayout {
            output_dir: PathBuf::from("/dl"),
            temp_dir: Some(PathBuf::from("/dl/temp_j1")),
            cookies: None,
            ffmpeg_location: Some(PathBuf::from("/tools/ffmpeg")),
        };
        let args = build_download_args(DownloadProfile::Fast, &DownloadOptions::default(), &out, "u");
        let joined = args.join(" ");
        assert!(joined.contains("--no-abort-on-error --paths temp:/dl/temp_j1"));
        assert!(joined.contains("--ffmpeg-location /tools/ffmpeg"));
        assert!(joined.contains("-f bestvideo*+bestaudio/bestvideo+bestaudio/best"));
        assert!(joined.contains("--merge-output-format mp4"));
        assert_eq!(
            args.iter().filter(|a| *a == "--ffmpeg-location").count(),
            1
        );

        let audio = DownloadOptions {
            format: Some("audio".into()),
            ..DownloadOptions::default()
        };
        let joined = build_download_args(DownloadProfile::Fast, &audio, &out, "u").join(" ");
        assert!(joined.contains("-f bestaudio/best -x --audio-format mp3"));
    }

    #[test]
    fn batch_items_restrict_filenames() {
        let options = DownloadOptions {
            quality: Some("worst".into()),
            format: Some("webm".into()),
            ..DownloadOptions::default()
        };
        let args = build_download_args(DownloadProfile::BatchItem, &options, &layout(), "u");
        let joined = args.join(" ");
        assert!(joined.contains("--restrict-filenames -o /dl/%(title)s.%(ext)s"));
        assert!(joined.contains("-f worst --merge-output-format webm"));
        assert!(!joined.contains("--remux-video"));
    }

    #[test]
    fn accelerator_flags_are_prepended_and_url_stays_last() {
        let base = build_download_args(
            DownloadProfile::BatchItem,
            &DownloadOptions::default(),
            &layout(),
            "https://example.com/v",
        );
        let args = with_accelerator(&base, Path::new("/tools/aria2c"), "-x 16 -k 1M -s 16");
        assert_eq!(
            &args[..4],
            &strings(&[
                "--external-downloader",
                "/tools/aria2c",
                "--external-downloader-args",
                "-x 16 -k 1M -s 16",
            ])[..]
        );
        assert_eq!(args.last().map(String::as_str), Some("https://example.com/v"));
        assert_eq!(args.len(), base.len() + 4);
    }

    #[test]
    fn media_info_parses_formats_and_ignores_extra_fields() {
        let stdout = r#"
WARNING: something unrelated
{"id":"abc","title":"Clip","duration":12.5,"view_count":null,"extra":{"x":1},
"formats":[{"format_id":"18","ext":"mp4","height":360,"vcodec":"avc1","acodec":"mp4a"},
{"format_id":"140","ext":"m4a","vcodec":"none","acodec":"mp4a","filesize":1000},
{"format_id":"137","ext":"mp4","height":1080,"vcodec":"avc1","acodec":"none"}]}
"#
        .replace(",\n\"formats\"", ",\"formats\"")
        .replace("},\n{", "},{");
        let info = parse_media_info(&stdout).expect("parse");
        assert_eq!(info.title, "Clip");
        assert_eq!(info.formats.len(), 3);
        assert!(info.formats[1].has_audio() && !info.formats[1].has_video());
        assert_eq!(info.formats[1].approx_size(), Some(1000));
        assert_eq!(info.video_heights(), vec![1080, 360]);
    }

    #[test]
    fn empty_metadata_output_is_upstream_failure() {
        let err = parse_media_info("ERROR: unsupported URL\n").expect_err("no json");
        assert!(matches!(err, EngineError::Upstream(_)));
    }

    #[cfg(unix)]
    #[test]
    fn fetch_info_runs_tool_and_parses_stdout() {
        let tool = ToolCommand {
            program: PathBuf::from("sh"),
            prefix_args: vec![
                "-c".to_string(),
                r#"printf '{"id":"x","title":"From %s"}\n' "$#""#.to_string(),
                "fake-yt-dlp".to_string(),
            ],
        };
        let info = fetch_info(&tool, "https://example.com/v", None).expect("info");
        assert_eq!(info.id, "x");
        // --dump-json --no-warnings --no-playlist <url>
        assert_eq!(info.title, "From 4");
    }

    fn script_tool(script: &str) -> ToolCommand {
        ToolCommand {
            program: PathBuf::from("sh"),
            prefix_args: vec![
                "-c".to_string(),
                script.to_string(),
                "fake-yt-dlp".to_string(),
            ],
        }
    }

    #[test]
    fn durations_format_like_clock_time() {
        assert_eq!(format_duration(None), "0:00");
        assert_eq!(format_duration(Some(0.0)), "0:00");
        assert_eq!(format_duration(Some(65.9)), "1:05");
        assert_eq!(format_duration(Some(3665.0)), "1:01:05");
    }

    #[test]
    fn playlist_entries_fall_back_to_id_and_first_thumbnail() {
        let stdout = concat!(
            r#"{"id":"aaa","title":"First","duration":125,"thumbnails":[{"url":"https://i/1.jpg"},{"url":"https://i/2.jpg"}]}"#,
            "\n",
            "not json at all\n",
            r#"{"id":"bbb","url":"https://example.com/b","title":"Second","duration_string":"4:20","thumbnail":"https://i/b.jpg"}"#,
            "\n",
            r#"{"title":"no address"}"#,
            "\n",
        );
        let playlist = parse_playlist(stdout);
        assert_eq!(playlist.count, 2);
        assert_eq!(
            playlist.videos[0],
            PlaylistEntry {
                url: "https://www.youtube.com/watch?v=aaa".to_string(),
                title: Some("First".to_string()),
                thumbnail: Some("https://i/1.jpg".to_string()),
                duration: "2:05".to_string(),
            }
        );
        assert_eq!(playlist.videos[1].url, "https://example.com/b");
        assert_eq!(playlist.videos[1].duration, "4:20");
        assert_eq!(playlist.videos[1].thumbnail.as_deref(), Some("https://i/b.jpg"));
    }

    #[cfg(unix)]
    #[test]
    fn fetch_playlist_keeps_output_of_a_failed_run() {
        let tool = script_tool(
            r#"echo '{"id":"x","title":"Only"}'; echo 'ERROR: one entry unavailable' >&2; exit 1"#,
        );
        let playlist = fetch_playlist(&tool, "https://example.com/list", None).expect("playlist");
        assert_eq!(playlist.count, 1);
        assert_eq!(playlist.videos[0].title.as_deref(), Some("Only"));

        let silent = script_tool("echo 'ERROR: private playlist' >&2; exit 1");
        let err = fetch_playlist(&silent, "https://example.com/list", None).expect_err("empty");
        assert!(matches!(err, EngineError::ExternalToolFailed { .. }), "{err}");
    }

    #[test]
    fn subtitle_args_expand_auto_language() {
        let args = subtitle_args("auto", Path::new("/dl/temp_subs_1")).join(" ");
        assert!(args.starts_with(
            "--skip-download --write-subs --write-auto-subs --sub-lang ar,en --sub-format srt/vtt/best --convert-subs srt"
        ));
        assert!(args.ends_with("-o /dl/temp_subs_1/%(title)s.%(ext)s"));

        let args = subtitle_args("fr", Path::new("/w"));
        assert!(args.windows(2).any(|w| w[0] == "--sub-lang" && w[1] == "fr"));
    }

    /// Writes into the directory of the `-o` template, like the real tool.
    #[cfg(unix)]
    const SUBTITLE_SCRIPT_PRELUDE: &str = r#"
prev=''; out=''
for a; do [ "$prev" = "-o" ] && out="$a"; prev="$a"; done
dir=$(dirname "$out")
"#;

    #[cfg(unix)]
    #[test]
    fn extract_subtitles_reads_track_and_removes_work_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let work = tmp.path().join("temp_subs_a");
        let tool = script_tool(&format!(
            r#"{SUBTITLE_SCRIPT_PRELUDE}
printf 'WEBVTT\n' > "$dir/Clip.ar.vtt"
printf '1\n00:00:01,000 --> 00:00:02,000\nhello\n' > "$dir/Clip.en.srt"
"#
        ));
        let track = extract_subtitles(&tool, "https://example.com/v", "auto", &work, None)
            .expect("extract")
            .expect("track");
        assert_eq!(track.format, "srt");
        assert_eq!(track.language, "en");
        assert!(track.subtitles.contains("hello"));
        assert!(!work.exists());
    }

    #[cfg(unix)]
    #[test]
    fn missing_subtitles_are_none_unless_the_tool_failed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let work = tmp.path().join("temp_subs_b");

        let none = script_tool(&format!("{SUBTITLE_SCRIPT_PRELUDE}\nexit 0\n"));
        let found = extract_subtitles(&none, "https://example.com/v", "ar", &work, None)
            .expect("no tracks is not an error");
        assert!(found.is_none());
        assert!(!work.exists());

        let failing = script_tool("echo 'ERROR: video unavailable' >&2; exit 1");
        let err = extract_subtitles(&failing, "https://example.com/v", "ar", &work, None)
            .expect_err("failed run");
        assert!(matches!(err, EngineError::ExternalToolFailed { .. }), "{err}");
        assert!(!work.exists());
    }
}
