use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Unterminated output kept before it is treated as a line anyway.
const MAX_PENDING_LINE_BYTES: usize = 64 * 1024;

/// Fields recognized in a piece of extraction tool output. Absent fields mean "not seen".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub percent: Option<f64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub destination: Option<PathBuf>,
}

impl ProgressUpdate {
    pub fn is_empty(&self) -> bool {
        self.percent.is_none()
            && self.speed.is_none()
            && self.eta.is_none()
            && self.destination.is_none()
    }

    /// Overlays the fields present in `later`.
    pub fn merge(&mut self, later: ProgressUpdate) {
        if later.percent.is_some() {
            self.percent = later.percent;
        }
        if later.speed.is_some() {
            self.speed = later.speed;
        }
        if later.eta.is_some() {
            self.eta = later.eta;
        }
        if later.destination.is_some() {
            self.destination = later.destination;
        }
    }
}

struct Patterns {
    percent: Regex,
    speed: Regex,
    eta: Regex,
    destination: Regex,
    merging: Regex,
    mixing: Regex,
    already_downloaded: Regex,
    format_segment: Regex,
    temp_marker: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        percent: Regex::new(r"(\d+(?:\.\d+)?)\s*%").expect("percent regex"),
        speed: Regex::new(r"(?i)(\d+(?:\.\d+)?\s*[KMG]iB/s)").expect("speed regex"),
        eta: Regex::new(r"(?i)\bETA\s+(\d{1,2}:\d{2}(?::\d{2})?)").expect("eta regex"),
        destination: Regex::new(r"(?i)Destination:\s*(.+?)\s*$").expect("destination regex"),
        merging: Regex::new(r#"(?i)Merging formats into\s+"([^"]+)""#).expect("merging regex"),
        mixing: Regex::new(r#"(?i)Mixing\s+.+\s+into\s+"([^"]+)""#).expect("mixing regex"),
        already_downloaded: Regex::new(r"(?i)\[download\]\s+(.+?)\s+has already been downloaded")
            .expect("already downloaded regex"),
        format_segment: Regex::new(r"(?i)\.f(?:\d+|hls|dash|http)[\w-]*\.\w+$")
            .expect("format segment regex"),
        temp_marker: Regex::new(r"(?i)(?:\.temp\.|\.temp$|\.part$|\.part-|\.ytdl$)")
            .expect("temp marker regex"),
    })
}

/// Whether a path names an intermediate stream or scratch file rather than a final artifact.
pub fn is_partial_artifact_path(path: &str) -> bool {
    let p = patterns();
    p.format_segment.is_match(path) || p.temp_marker.is_match(path)
}

/// Matches one piece of output text. The first match wins per category, except the
/// destination, where the last acceptable line wins. Lines naming an output file are
/// never read for progress, since titles may contain percentages or speeds.
pub fn parse_progress_text(text: &str) -> ProgressUpdate {
    let p = patterns();
    let capture = |re: &Regex, line: &str| {
        re.captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    };

    let mut update = ProgressUpdate::default();
    for line in text.lines() {
        if is_destination_line(line) {
            if let Some(candidate) = destination_candidate(line) {
                update.destination = Some(candidate);
            }
            continue;
        }
        if update.percent.is_none() {
            update.percent = capture(&p.percent, line).and_then(|m| m.parse::<f64>().ok());
        }
        if update.speed.is_none() {
            update.speed = capture(&p.speed, line);
        }
        if update.eta.is_none() {
            update.eta = capture(&p.eta, line);
        }
    }
    update
}

fn is_destination_line(line: &str) -> bool {
    let p = patterns();
    [&p.merging, &p.mixing, &p.already_downloaded, &p.destination]
        .iter()
        .any(|re| re.is_match(line))
}

fn destination_candidate(line: &str) -> Option<PathBuf> {
    let p = patterns();
    let raw = [&p.merging, &p.mixing, &p.already_downloaded, &p.destination]
        .iter()
        .find_map(|re| re.captures(line).and_then(|c| c.get(1)))?
        .as_str()
        .trim()
        .trim_matches('"');
    if raw.is_empty() || is_partial_artifact_path(raw) {
        return None;
    }
    Some(PathBuf::from(raw))
}

/// Line accumulator over raw output chunks. Chunk boundaries may fall anywhere.
#[derive(Debug, Default)]
pub struct ProgressParser {
    pending: String,
    destination: Option<PathBuf>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a chunk and returns the merged update of every line it completed.
    pub fn feed(&mut self, chunk: &str) -> ProgressUpdate {
        self.pending.push_str(chunk);
        let mut update = ProgressUpdate::default();
        while let Some(idx) = self.pending.find(|c: char| c == '\n' || c == '\r') {
            let line = self.pending[..idx].to_string();
            self.pending.replace_range(..=idx, "");
            self.absorb_line(&line, &mut update);
        }
        if self.pending.len() > MAX_PENDING_LINE_BYTES {
            let line = std::mem::take(&mut self.pending);
            self.absorb_line(&line, &mut update);
        }
        update
    }

    /// Flushes the trailing unterminated line.
    pub fn finish(&mut self) -> ProgressUpdate {
        let mut update = ProgressUpdate::default();
        let line = std::mem::take(&mut self.pending);
        self.absorb_line(&line, &mut update);
        update
    }

    /// Last acceptable destination seen so far.
    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    fn absorb_line(&mut self, line: &str, update: &mut ProgressUpdate) {
        if line.trim().is_empty() {
            return;
        }
        let parsed = parse_progress_text(line);
        if let Some(dest) = &parsed.destination {
            self.destination = Some(dest.clone());
        }
        update.merge(parsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_progress_line() {
        let update = parse_progress_text("  43.2% of 120MiB at 5.30MiB/s ETA 01:23");
        assert_eq!(update.percent, Some(43.2));
        assert_eq!(update.speed.as_deref(), Some("5.30MiB/s"));
        assert_eq!(update.eta.as_deref(), Some("01:23"));
        assert_eq!(update.destination, None);
    }

    #[test]
    fn matching_is_case_insensitive_and_accepts_hour_eta() {
        let update = parse_progress_text("[download]   7% of ~1.2GiB at 850.5kib/s eta 1:02:03");
        assert_eq!(update.percent, Some(7.0));
        assert_eq!(update.speed.as_deref(), Some("850.5kib/s"));
        assert_eq!(update.eta.as_deref(), Some("1:02:03"));
    }

    #[test]
    fn unknown_eta_and_speed_are_left_unset() {
        let update = parse_progress_text("[download]  12.0% of 3.00MiB at Unknown B/s ETA Unknown");
        assert_eq!(update.percent, Some(12.0));
        assert!(update.speed.is_none());
        assert!(update.eta.is_none());
    }

    #[test]
    fn partial_format_paths_are_rejected() {
        for path in [
            "/d/clip.f137.mp4",
            "/d/clip.f251-drc.webm",
            "/d/clip.fhls-1080p.mp4",
            "/d/clip.temp.mp4",
            "/d/clip.mp4.part",
            "/d/clip.mp4.ytdl",
        ] {
            assert!(is_partial_artifact_path(path), "{path} should be partial");
        }
        for path in ["/d/clip.mp4", "/d/my.film.mp4", "/d/f137 notes.mkv"] {
            assert!(!is_partial_artifact_path(path), "{path} should be final");
        }
    }

    #[test]
    fn merge_line_beats_format_destinations() {
        let output = "[download] Destination: /d/clip.f137.mp4\n\
                      [download] Destination: /d/clip.f140.m4a\n\
                      [Merger] Merging formats into \"/d/clip.mp4\"\n";
        let update = parse_progress_text(output);
        assert_eq!(update.destination, Some(PathBuf::from("/d/clip.mp4")));
    }

    #[test]
    fn last_acceptable_destination_wins() {
        let mut parser = ProgressParser::new();
        parser.feed("[download] Destination: /d/first.mp4\n");
        parser.feed("[ExtractAudio] Destination: /d/first.mp3\n");
        parser.feed("[download] Destination: /d/first.f251.webm\n");
        assert_eq!(parser.destination(), Some(Path::new("/d/first.mp3")));
    }

    #[test]
    fn mixing_and_already_downloaded_lines_are_destinations() {
        let mixing = parse_progress_text("[Mixing] Mixing 2 streams into \"/d/mixed.mkv\"");
        assert_eq!(mixing.destination, Some(PathBuf::from("/d/mixed.mkv")));

        let cached =
            parse_progress_text("[download] /d/cached.mp4 has already been downloaded");
        assert_eq!(cached.destination, Some(PathBuf::from("/d/cached.mp4")));
    }

    #[test]
    fn chunk_boundaries_do_not_split_tokens() {
        let mut parser = ProgressParser::new();
        let first = parser.feed("[download]  43.");
        assert!(first.is_empty());
        let second = parser.feed("2% of 120MiB at 5.3");
        assert!(second.is_empty());
        let third = parser.feed("0MiB/s ETA 01:23\n[download]  50.0%");
        assert_eq!(third.percent, Some(43.2));
        assert_eq!(third.speed.as_deref(), Some("5.30MiB/s"));

        let tail = parser.finish();
        assert_eq!(tail.percent, Some(50.0));
    }

    #[test]
    fn carriage_returns_separate_updates_and_later_lines_win() {
        let mut parser = ProgressParser::new();
        let update =
            parser.feed("\r 10.0% at 1.00MiB/s ETA 00:09\r 20.0% at 2.00MiB/s ETA 00:04\r");
        assert_eq!(update.percent, Some(20.0));
        assert_eq!(update.speed.as_deref(), Some("2.00MiB/s"));
        assert_eq!(update.eta.as_deref(), Some("00:04"));
    }

    #[test]
    fn percentages_in_file_names_are_not_progress() {
        let line = parse_progress_text("[download] Destination: /d/100% Real at 5MiB/s.mp4");
        assert_eq!(line.percent, None);
        assert_eq!(line.speed, None);
        assert_eq!(line.destination, Some(PathBuf::from("/d/100% Real at 5MiB/s.mp4")));

        let mut parser = ProgressParser::new();
        let update = parser.feed(
            "[download] Destination: /d/100% Real.mp4\n[download]   5.0% of 10.00MiB at 1.00MiB/s ETA 00:09\n",
        );
        assert_eq!(update.percent, Some(5.0));
        assert_eq!(update.speed.as_deref(), Some("1.00MiB/s"));
        assert_eq!(parser.destination(), Some(Path::new("/d/100% Real.mp4")));
    }

    #[test]
    fn merge_keeps_fields_missing_from_later_update() {
        let mut base = parse_progress_text("10% at 1.00MiB/s ETA 00:10");
        base.merge(parse_progress_text("15%"));
        assert_eq!(base.percent, Some(15.0));
        assert_eq!(base.speed.as_deref(), Some("1.00MiB/s"));
        assert_eq!(base.eta.as_deref(), Some("00:10"));
    }
}
