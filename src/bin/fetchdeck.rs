use std::path::PathBuf;
use std::time::Duration;

use fetchdeck_engine::batch::{BatchVideoRequest, ParallelDownloadRequest};
use fetchdeck_engine::download::DownloadRequest;
use fetchdeck_engine::job::JobStatus;
use fetchdeck_engine::paths::AppPaths;
use fetchdeck_engine::Engine;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut urls: Vec<String> = Vec::new();
    let mut info_url: Option<String> = None;
    let mut playlist_url: Option<String> = None;
    let mut subtitles_url: Option<String> = None;
    let mut lang: Option<String> = None;
    let mut check = false;
    let mut install = false;
    let mut audio_only = false;
    let mut quality: Option<String> = None;
    let mut format: Option<String> = None;
    let mut turbo = true;
    let mut max_concurrent: Option<usize> = None;
    let mut zip = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--base-dir requires a value".to_string())?;
                base_dir = Some(PathBuf::from(v));
            }
            "--url" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--url requires a value".to_string())?;
                urls.push(v.to_string());
            }
            "--info" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--info requires a value".to_string())?;
                info_url = Some(v.to_string());
            }
            "--playlist" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--playlist requires a value".to_string())?;
                playlist_url = Some(v.to_string());
            }
            "--subtitles" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--subtitles requires a value".to_string())?;
                subtitles_url = Some(v.to_string());
            }
            "--lang" => {
                i += 1;
                lang = Some(
                    args.get(i)
                        .ok_or_else(|| "--lang requires a value".to_string())?
                        .to_string(),
                );
            }
            "--quality" => {
                i += 1;
                quality = Some(
                    args.get(i)
                        .ok_or_else(|| "--quality requires a value".to_string())?
                        .to_string(),
                );
            }
            "--format" => {
                i += 1;
                format = Some(
                    args.get(i)
                        .ok_or_else(|| "--format requires a value".to_string())?
                        .to_string(),
                );
            }
            "--max-concurrent" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--max-concurrent requires a value".to_string())?;
                max_concurrent = Some(
                    v.parse()
                        .map_err(|_| format!("--max-concurrent expects a number, got {v}"))?,
                );
            }
            "--audio" => audio_only = true,
            "--no-turbo" => turbo = false,
            "--zip" => zip = true,
            "--check" => check = true,
            "--install-tools" => install = true,
            other => return Err(format!("unknown arg: {other} (try --help)")),
        }
        i += 1;
    }

    if urls.is_empty()
        && info_url.is_none()
        && playlist_url.is_none()
        && subtitles_url.is_none()
        && !check
        && !install
    {
        return Err(
            "nothing to do (pass --url, --playlist, --info, --subtitles, --check or --install-tools)"
                .to_string(),
        );
    }
    if playlist_url.is_some() && !urls.is_empty() {
        return Err("--playlist cannot be combined with --url".to_string());
    }

    let base_dir = base_dir
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let engine = Engine::open(AppPaths::new(base_dir)).map_err(|e| e.to_string())?;
    println!(
        "Base dir: {}",
        engine.paths().base_dir.to_string_lossy()
    );

    if install {
        println!("yt-dlp: installing...");
        let ytdlp = engine.install_ytdlp().map_err(|e| e.to_string())?;
        println!("yt-dlp: {} ({})", ytdlp.version.unwrap_or_default(), ytdlp.path);
        println!("FFmpeg: installing...");
        let ffmpeg = engine.install_ffmpeg().map_err(|e| e.to_string())?;
        println!("FFmpeg: {} ({})", ffmpeg.version.unwrap_or_default(), ffmpeg.path);
    }

    if check {
        let status = engine.tools_status();
        let json = serde_json::to_string_pretty(&status).map_err(|e| e.to_string())?;
        println!("{json}");
    }

    if let Some(url) = info_url {
        let info = engine.fetch_info(&url).map_err(|e| e.to_string())?;
        println!("{}", info.title);
        if let Some(uploader) = &info.uploader {
            println!("  by {uploader}");
        }
        if let Some(duration) = info.duration {
            println!("  duration: {duration:.0}s");
        }
        let heights: Vec<String> = info
            .video_heights()
            .into_iter()
            .map(|h| format!("{h}p"))
            .collect();
        if !heights.is_empty() {
            println!("  qualities: {}", heights.join(", "));
        }
        println!("  formats: {}", info.formats.len());
    }

    if let Some(url) = subtitles_url {
        match engine
            .extract_subtitles(&url, lang.as_deref())
            .map_err(|e| e.to_string())?
        {
            Some(track) => {
                eprintln!("Subtitles: {} ({})", track.language, track.format);
                print!("{}", track.subtitles);
            }
            None => println!("No subtitles available"),
        }
    }

    if let Some(url) = playlist_url {
        let playlist = engine.fetch_playlist(&url).map_err(|e| e.to_string())?;
        println!("Playlist: {} entries", playlist.count);
        for (i, entry) in playlist.videos.iter().enumerate() {
            println!(
                "  {:>3}. [{}] {}",
                i + 1,
                entry.duration,
                entry.title.as_deref().unwrap_or(&entry.url)
            );
        }
        if playlist.count == 0 {
            return Ok(());
        }
        let mut request = ParallelDownloadRequest::from_playlist(&playlist, max_concurrent);
        for video in &mut request.videos {
            video.quality = quality.clone();
            video.format = format.clone();
            video.audio_only = audio_only;
            video.turbo = Some(turbo);
        }
        let accepted = engine.start_parallel(request).map_err(|e| e.to_string())?;
        return follow_batch(&engine, &accepted.batch_id, zip);
    }

    match urls.len() {
        0 => Ok(()),
        1 => {
            let accepted = engine
                .start_download(DownloadRequest {
                    url: urls.remove(0),
                    quality,
                    format,
                    audio_only,
                    turbo,
                    ..DownloadRequest::default()
                })
                .map_err(|e| e.to_string())?;
            follow_download(&engine, &accepted.download_id)
        }
        _ => {
            let videos = urls
                .into_iter()
                .map(|url| BatchVideoRequest {
                    url,
                    quality: quality.clone(),
                    format: format.clone(),
                    audio_only,
                    turbo: Some(turbo),
                    ..BatchVideoRequest::default()
                })
                .collect();
            let accepted = engine
                .start_parallel(ParallelDownloadRequest {
                    videos,
                    max_concurrent,
                })
                .map_err(|e| e.to_string())?;
            follow_batch(&engine, &accepted.batch_id, zip)
        }
    }
}

fn follow_download(engine: &Engine, id: &str) -> Result<(), String> {
    let mut last = String::new();
    loop {
        let job = engine.progress(id).map_err(|e| e.to_string())?;
        let line = format!(
            "[{}] {:>5.1}% {} {}",
            job.status.as_str(),
            job.progress,
            job.speed.as_deref().unwrap_or(""),
            job.eta.as_deref().map(|e| format!("ETA {e}")).unwrap_or_default()
        );
        if line != last {
            println!("{}", line.trim_end());
            last = line;
        }
        match job.status {
            JobStatus::Completed => {
                match (&job.filename, &job.download_url) {
                    (Some(name), Some(url)) => println!("Saved: {name} ({url})"),
                    (Some(name), None) => println!("Saved: {name}"),
                    _ => println!("Completed (output file could not be identified)"),
                }
                return Ok(());
            }
            JobStatus::Error => {
                return Err(job.error.clone().unwrap_or_else(|| "download failed".to_string()))
            }
            _ => std::thread::sleep(POLL_INTERVAL),
        }
    }
}

fn follow_batch(engine: &Engine, id: &str, zip: bool) -> Result<(), String> {
    let mut last = String::new();
    let snapshot = loop {
        let snapshot = engine.batch_progress(id).map_err(|e| e.to_string())?;
        let line = format!(
            "batch {}: {}/{} done, {} failed, {} running, {:.0}% {}",
            snapshot.batch_id,
            snapshot.completed,
            snapshot.total,
            snapshot.failed,
            snapshot.downloading,
            snapshot.progress,
            snapshot.speed
        );
        if line != last {
            println!("{}", line.trim_end());
            last = line;
        }
        if snapshot.is_complete {
            break snapshot;
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    for item in &snapshot.videos {
        match item.job.status {
            JobStatus::Completed => println!(
                "  ok   {} -> {}",
                item.title,
                item.job.filename.as_deref().unwrap_or("?")
            ),
            _ => println!(
                "  fail {}: {}",
                item.title,
                item.job.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    if zip && snapshot.completed > 0 {
        let archive = engine.create_batch_zip(id).map_err(|e| e.to_string())?;
        println!(
            "Archive: {} ({} files, {} bytes, sha256 {})",
            archive.path.to_string_lossy(),
            archive.entries,
            archive.bytes,
            archive.sha256
        );
    }

    if snapshot.failed > 0 {
        return Err(format!("{} of {} downloads failed", snapshot.failed, snapshot.total));
    }
    Ok(())
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("FETCHDECK_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }

    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let t = appdata.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t).join("fetchdeck"));
            }
        }
    }

    std::env::var("HOME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .map(|h| PathBuf::from(h).join(".fetchdeck"))
}

fn print_help() {
    println!(
        r#"fetchdeck

Downloads media through yt-dlp with live progress.

Usage:
  fetchdeck --url <url>                      Single download
  fetchdeck --url <a> --url <b> [--zip]      Parallel batch download
  fetchdeck --playlist <url> [--zip]         Download every playlist entry as a batch
  fetchdeck --info <url>                     Print metadata
  fetchdeck --subtitles <url> [--lang <l>]   Print the subtitle track (srt or vtt)
  fetchdeck --check                          Show tool status

Options:
  --base-dir <path>       Override base dir (default: $FETCHDECK_BASE_DIR or ~/.fetchdeck)
  --quality <q>           Format selector or height (e.g. 720, best)
  --format <ext>          Container or audio format (mp4, mkv, mp3, ...)
  --audio                 Audio only
  --no-turbo              Skip the download accelerator
  --max-concurrent <n>    Batch concurrency (1-5)
  --lang <code>           Subtitle language, or auto for ar,en (default: ar)
  --zip                   Pack a finished batch into batch_<id>.zip
  --install-tools         Install yt-dlp and FFmpeg into <base-dir>/tools
"#
    );
}
