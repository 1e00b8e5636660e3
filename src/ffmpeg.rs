use crate::config::EngineSettings;
use crate::paths::AppPaths;
use crate::process::{self, ProcessSpec, RunControl};
use crate::tools;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Resolved ffmpeg and ffprobe executables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegTools {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl FfmpegTools {
    pub fn resolve(paths: &AppPaths, settings: &EngineSettings) -> Self {
        let ffmpeg = tools::ffmpeg_program(paths, settings);
        // A configured ffmpeg path brings its sibling ffprobe along.
        let ffprobe = match ffmpeg.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) if settings.tools.ffmpeg_path.is_some() => {
                let mut sibling = dir.join("ffprobe");
                if cfg!(windows) {
                    sibling.set_extension("exe");
                }
                sibling
            }
            _ => paths.ffprobe_cmd(),
        };
        Self { ffmpeg, ffprobe }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaProbe {
    pub duration_ms: Option<i64>,
    pub container: Option<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GifOptions {
    pub start_secs: f64,
    pub duration_secs: f64,
    pub width: u32,
}

impl Default for GifOptions {
    fn default() -> Self {
        Self {
            start_secs: 0.0,
            duration_secs: 5.0,
            width: 480,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl CompressQuality {
    pub fn crf(self) -> u8 {
        match self {
            CompressQuality::Low => 35,
            CompressQuality::Medium => 28,
            CompressQuality::High => 23,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Flac,
    Wav,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Flac => "flac",
            AudioFormat::Wav => "wav",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThumbnailOptions {
    pub at_secs: f64,
    pub width: u32,
}

impl Default for ThumbnailOptions {
    fn default() -> Self {
        Self {
            at_secs: 5.0,
            width: 1280,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompressResult {
    pub output: PathBuf,
    pub original_bytes: u64,
    pub compressed_bytes: u64,
    /// Percent saved; negative when the output grew.
    pub reduction_percent: i64,
}

pub fn probe(tools: &FfmpegTools, input: &Path) -> Result<MediaProbe> {
    let args: Vec<String> = [
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
    ]
    .into_iter()
    .map(str::to_string)
    .chain(std::iter::once(input.to_string_lossy().to_string()))
    .collect();
    let stdout = run_tool("ffprobe", &tools.ffprobe, args)?;
    let mut probe = parse_probe(&stdout)?;
    if probe.size_bytes.is_none() {
        probe.size_bytes = std::fs::metadata(input).ok().map(|m| m.len());
    }
    Ok(probe)
}

pub fn parse_probe(stdout: &str) -> Result<MediaProbe> {
    let parsed: FfprobeOutput = serde_json::from_str(stdout)?;
    let streams = parsed.streams.unwrap_or_default();
    let format = parsed.format;

    let video = streams
        .iter()
        .find(|st| st.codec_type.as_deref() == Some("video"));
    let audio_codec = streams
        .iter()
        .find(|st| st.codec_type.as_deref() == Some("audio"))
        .and_then(|st| st.codec_name.clone());

    Ok(MediaProbe {
        duration_ms: format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .and_then(parse_seconds_to_ms),
        container: format
            .as_ref()
            .and_then(|f| f.format_name.as_deref())
            .map(first_format_name),
        video_codec: video.and_then(|st| st.codec_name.clone()),
        audio_codec,
        width: video.and_then(|st| st.width),
        height: video.and_then(|st| st.height),
        size_bytes: format
            .as_ref()
            .and_then(|f| f.size.as_deref())
            .and_then(|s| s.trim().parse().ok()),
    })
}

pub fn gif_args(input: &Path, output: &Path, options: GifOptions) -> Vec<String> {
    let filter = format!(
        "fps=15,scale={}:-1:flags=lanczos,split[s0][s1];[s0]palettegen[p];[s1][p]paletteuse",
        options.width.max(16)
    );
    let mut args = base_args(input);
    push_all(
        &mut args,
        [
            "-ss".to_string(),
            format_secs(options.start_secs),
            "-t".to_string(),
            format_secs(options.duration_secs.max(0.1)),
            "-vf".to_string(),
            filter,
        ],
    );
    args.push(output.to_string_lossy().to_string());
    args
}

pub fn compress_args(input: &Path, output: &Path, quality: CompressQuality) -> Vec<String> {
    let mut args = base_args(input);
    push_all(
        &mut args,
        [
            "-c:v".to_string(),
            "libx264".to_string(),
            "-crf".to_string(),
            quality.crf().to_string(),
            "-preset".to_string(),
            "fast".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "128k".to_string(),
        ],
    );
    args.push(output.to_string_lossy().to_string());
    args
}

pub fn extract_audio_args(
    input: &Path,
    output: &Path,
    format: AudioFormat,
    bitrate: Option<&str>,
) -> Vec<String> {
    let mut args = base_args(input);
    args.push("-vn".into());
    match format {
        AudioFormat::Mp3 => {
            let bitrate = bitrate.map(str::trim).filter(|b| !b.is_empty()).unwrap_or("320k");
            push_all(&mut args, ["-c:a", "libmp3lame", "-b:a", bitrate]);
        }
        AudioFormat::Flac => push_all(&mut args, ["-c:a", "flac"]),
        AudioFormat::Wav => push_all(&mut args, ["-c:a", "pcm_s16le"]),
    }
    args.push(output.to_string_lossy().to_string());
    args
}

pub fn thumbnail_args(input: &Path, output: &Path, options: ThumbnailOptions) -> Vec<String> {
    let mut args = base_args(input);
    push_all(
        &mut args,
        [
            "-ss".to_string(),
            format_secs(options.at_secs),
            "-frames:v".to_string(),
            "1".to_string(),
            "-vf".to_string(),
            format!("scale={}:-2", options.width.max(16)),
            "-q:v".to_string(),
            "2".to_string(),
        ],
    );
    args.push(output.to_string_lossy().to_string());
    args
}

/// `clip.mp4` -> `clip.gif`, next to the input.
pub fn convert_to_gif(tools: &FfmpegTools, input: &Path, options: GifOptions) -> Result<PathBuf> {
    let output = sibling_output(input, "", "gif")?;
    run_tool("ffmpeg", &tools.ffmpeg, gif_args(input, &output, options))?;
    Ok(output)
}

/// `clip.mkv` -> `clip_compressed.mp4`.
pub fn compress_video(
    tools: &FfmpegTools,
    input: &Path,
    quality: CompressQuality,
) -> Result<CompressResult> {
    let original_bytes = std::fs::metadata(input)?.len();
    let output = sibling_output(input, "_compressed", "mp4")?;
    run_tool("ffmpeg", &tools.ffmpeg, compress_args(input, &output, quality))?;
    let compressed_bytes = std::fs::metadata(&output)?.len();
    Ok(CompressResult {
        output,
        original_bytes,
        compressed_bytes,
        reduction_percent: reduction_percent(original_bytes, compressed_bytes),
    })
}

pub fn extract_audio(
    tools: &FfmpegTools,
    input: &Path,
    format: AudioFormat,
    bitrate: Option<&str>,
) -> Result<PathBuf> {
    let output = sibling_output(input, "", format.extension())?;
    if output == input {
        return Err(EngineError::InvalidRequest(format!(
            "input is already {}: {}",
            format.extension(),
            input.to_string_lossy()
        )));
    }
    run_tool(
        "ffmpeg",
        &tools.ffmpeg,
        extract_audio_args(input, &output, format, bitrate),
    )?;
    Ok(output)
}

/// `clip.mp4` -> `clip_thumb.jpg`.
pub fn generate_thumbnail(
    tools: &FfmpegTools,
    input: &Path,
    options: ThumbnailOptions,
) -> Result<PathBuf> {
    let output = sibling_output(input, "_thumb", "jpg")?;
    run_tool("ffmpeg", &tools.ffmpeg, thumbnail_args(input, &output, options))?;
    Ok(output)
}

fn run_tool(tool: &str, program: &Path, args: Vec<String>) -> Result<String> {
    let spec = ProcessSpec::new(tool, program).args(args);
    let (stdout, exit) = process::capture_output(&spec, RunControl::default())?;
    exit.ensure_success(tool)?;
    Ok(stdout)
}

fn base_args(input: &Path) -> Vec<String> {
    vec![
        "-nostdin".into(),
        "-y".into(),
        "-i".into(),
        input.to_string_lossy().to_string(),
    ]
}

fn push_all<I, S>(args: &mut Vec<String>, items: I)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.extend(items.into_iter().map(Into::into));
}

fn sibling_output(input: &Path, suffix: &str, extension: &str) -> Result<PathBuf> {
    if !input.is_file() {
        return Err(EngineError::NotFound {
            kind: "media file",
            id: input.to_string_lossy().to_string(),
        });
    }
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(input.with_file_name(format!("{stem}{suffix}.{extension}")))
}

fn format_secs(value: f64) -> String {
    let value = if value.is_finite() && value >= 0.0 { value } else { 0.0 };
    format!("{value:.3}")
}

fn reduction_percent(original: u64, compressed: u64) -> i64 {
    if original == 0 {
        return 0;
    }
    ((1.0 - compressed as f64 / original as f64) * 100.0).round() as i64
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeOutput {
    streams: Option<Vec<FfprobeStream>>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
}

fn first_format_name(value: &str) -> String {
    value.split(',').next().unwrap_or(value).trim().to_string()
}

fn parse_seconds_to_ms(value: &str) -> Option<i64> {
    let seconds: f64 = value.parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some((seconds * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[String]) -> Vec<String> {
        args.to_vec()
    }

    #[test]
    fn compress_uses_crf_per_quality() {
        let args = strings(&compress_args(
            Path::new("in.mkv"),
            Path::new("in_compressed.mp4"),
            CompressQuality::Low,
        ));
        let crf = args.iter().position(|a| a == "-crf").expect("crf");
        assert_eq!(args[crf + 1], "35");
        assert_eq!(CompressQuality::High.crf(), 23);
        assert_eq!(CompressQuality::default().crf(), 28);
        assert_eq!(args.last().map(String::as_str), Some("in_compressed.mp4"));
    }

    #[test]
    fn audio_codec_follows_format() {
        let mp3 = strings(&extract_audio_args(
            Path::new("a.mp4"),
            Path::new("a.mp3"),
            AudioFormat::Mp3,
            None,
        ));
        assert!(mp3.windows(2).any(|w| w == ["-b:a", "320k"]));
        assert!(mp3.windows(2).any(|w| w == ["-c:a", "libmp3lame"]));

        let flac = strings(&extract_audio_args(
            Path::new("a.mp4"),
            Path::new("a.flac"),
            AudioFormat::Flac,
            Some("128k"),
        ));
        assert!(flac.windows(2).any(|w| w == ["-c:a", "flac"]));
        assert!(!flac.contains(&"128k".to_string()));

        let wav = strings(&extract_audio_args(
            Path::new("a.mp4"),
            Path::new("a.wav"),
            AudioFormat::Wav,
            None,
        ));
        assert!(wav.windows(2).any(|w| w == ["-c:a", "pcm_s16le"]));
    }

    #[test]
    fn gif_and_thumbnail_args_carry_width_and_time() {
        let gif = strings(&gif_args(
            Path::new("v.mp4"),
            Path::new("v.gif"),
            GifOptions {
                start_secs: 2.5,
                duration_secs: 3.0,
                width: 320,
            },
        ));
        assert!(gif.windows(2).any(|w| w == ["-ss", "2.500"]));
        assert!(gif.windows(2).any(|w| w == ["-t", "3.000"]));
        assert!(gif.iter().any(|a| a.starts_with("fps=15,scale=320:-1")));

        let thumb = strings(&thumbnail_args(
            Path::new("v.mp4"),
            Path::new("v_thumb.jpg"),
            ThumbnailOptions {
                at_secs: f64::NAN,
                width: 1280,
            },
        ));
        assert!(thumb.windows(2).any(|w| w == ["-ss", "0.000"]));
        assert!(thumb.windows(2).any(|w| w == ["-vf", "scale=1280:-2"]));
    }

    #[test]
    fn outputs_land_next_to_the_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("clip.mkv");
        std::fs::write(&input, b"x").expect("write");
        assert_eq!(
            sibling_output(&input, "_compressed", "mp4").expect("out"),
            dir.path().join("clip_compressed.mp4")
        );
        assert_eq!(
            sibling_output(&input, "", "gif").expect("out"),
            dir.path().join("clip.gif")
        );

        let missing = sibling_output(&dir.path().join("nope.mp4"), "", "gif").expect_err("missing");
        assert_eq!(missing.http_status(), 404);
    }

    #[test]
    fn reduction_is_rounded_percent_saved() {
        assert_eq!(reduction_percent(1000, 250), 75);
        assert_eq!(reduction_percent(1000, 1100), -10);
        assert_eq!(reduction_percent(0, 10), 0);
    }

    #[test]
    fn probe_json_picks_first_video_and_audio_streams() {
        let json = r#"{
            "streams": [
                {"codec_type":"audio","codec_name":"aac"},
                {"codec_type":"video","codec_name":"h264","width":1920,"height":1080}
            ],
            "format": {"format_name":"mov,mp4,m4a","duration":"12.3456","size":"2048"}
        }"#;
        let probe = parse_probe(json).expect("parse");
        assert_eq!(probe.container.as_deref(), Some("mov"));
        assert_eq!(probe.duration_ms, Some(12346));
        assert_eq!(probe.video_codec.as_deref(), Some("h264"));
        assert_eq!(probe.audio_codec.as_deref(), Some("aac"));
        assert_eq!(probe.height, Some(1080));
        assert_eq!(probe.size_bytes, Some(2048));
    }

    #[test]
    fn missing_ffmpeg_binary_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("clip.mp4");
        std::fs::write(&input, b"x").expect("write");
        let tools = FfmpegTools {
            ffmpeg: dir.path().join("no-such-ffmpeg"),
            ffprobe: dir.path().join("no-such-ffprobe"),
        };
        let err = generate_thumbnail(&tools, &input, ThumbnailOptions::default())
            .expect_err("missing");
        assert!(matches!(err, EngineError::ExternalToolMissing { .. }));
    }

    #[test]
    fn configured_ffmpeg_brings_sibling_ffprobe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let mut settings = EngineSettings::default();
        settings.tools.ffmpeg_path = Some("/opt/ff/ffmpeg".to_string());
        let tools = FfmpegTools::resolve(&paths, &settings);
        assert_eq!(tools.ffmpeg, PathBuf::from("/opt/ff/ffmpeg"));
        if !cfg!(windows) {
            assert_eq!(tools.ffprobe, PathBuf::from("/opt/ff/ffprobe"));
        }
    }
}
