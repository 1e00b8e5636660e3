use crate::{EngineError, Result};
use std::ffi::OsStr;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

const POLL_INTERVAL_MS: u64 = 200;
const EXIT_DRAIN_GRACE_MS: u64 = 1000;
const STDERR_TAIL_BYTES: usize = 4096;
const READ_BUF_BYTES: usize = 8192;

pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Keep tool console windows from popping up over the app.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

/// One external program invocation.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Short tool name used in error messages ("yt-dlp", "ffmpeg").
    pub tool: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(tool: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Space-joined program and arguments, for logs.
    pub fn display_command(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub success: bool,
    pub stderr_tail: String,
    pub finished_at: SystemTime,
}

impl ProcessExit {
    /// Turns a nonzero exit into `ExternalToolFailed`.
    pub fn ensure_success(self, tool: &str) -> Result<ProcessExit> {
        if self.success {
            return Ok(self);
        }
        Err(EngineError::ExternalToolFailed {
            tool: tool.to_string(),
            code: self.code,
            stderr: self.stderr_tail.trim().to_string(),
        })
    }
}

/// Cancellation and deadline applied while a process runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunControl<'a> {
    pub cancel: Option<&'a AtomicBool>,
    pub timeout: Option<Duration>,
}

impl RunControl<'_> {
    fn is_canceled(&self) -> bool {
        self.cancel
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

pub struct ProcessHandle {
    tool: String,
    child: Child,
    chunks: Receiver<OutputChunk>,
}

impl ProcessHandle {
    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Next decoded output chunk from either stream.
    pub fn recv_chunk(
        &self,
        timeout: Duration,
    ) -> std::result::Result<OutputChunk, RecvTimeoutError> {
        self.chunks.recv_timeout(timeout)
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    pub fn kill(&mut self) {
        #[cfg(windows)]
        {
            let pid = self.child.id().to_string();
            let _ = command("taskkill")
                .args(["/PID", &pid, "/T", "/F"])
                .status();
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    pub fn wait(mut self) -> Result<ExitStatus> {
        Ok(self.child.wait()?)
    }
}

pub fn spawn(spec: &ProcessSpec) -> Result<ProcessHandle> {
    let mut cmd = command(&spec.program);
    cmd.args(&spec.args);
    for (key, value) in &spec.envs {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => EngineError::ExternalToolMissing {
            tool: spec.tool.clone(),
        },
        _ => EngineError::ExternalToolSpawn {
            tool: spec.tool.clone(),
            source: e,
        },
    })?;

    let (tx, rx) = mpsc::channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, OutputStream::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, OutputStream::Stderr, tx);
    }

    Ok(ProcessHandle {
        tool: spec.tool.clone(),
        child,
        chunks: rx,
    })
}

/// Pumps output into `on_chunk` until the process exits, honoring cancel and timeout.
///
/// A nonzero exit is not an error here; callers decide via [`ProcessExit::ensure_success`].
pub fn run_to_completion(
    mut handle: ProcessHandle,
    control: RunControl<'_>,
    mut on_chunk: impl FnMut(&OutputChunk),
) -> Result<ProcessExit> {
    let poll = Duration::from_millis(POLL_INTERVAL_MS);
    let grace = Duration::from_millis(EXIT_DRAIN_GRACE_MS);
    let started = Instant::now();
    let mut stderr_tail = String::new();
    let mut disconnected = false;
    let mut exit: Option<(ExitStatus, Instant, SystemTime)> = None;

    let (status, finished_at) = loop {
        if disconnected {
            thread::sleep(poll);
        } else {
            match handle.recv_chunk(poll) {
                Ok(chunk) => {
                    if chunk.stream == OutputStream::Stderr {
                        push_tail(&mut stderr_tail, &chunk.text);
                    }
                    on_chunk(&chunk);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => disconnected = true,
            }
        }

        // Output written just before exit may still be in the pipe.
        if let Some((status, seen_at, finished_at)) = exit {
            if disconnected || seen_at.elapsed() >= grace {
                break (status, finished_at);
            }
            continue;
        }

        if control.is_canceled() {
            handle.kill();
            return Err(EngineError::Canceled);
        }
        if let Some(limit) = control.timeout {
            if started.elapsed() >= limit {
                handle.kill();
                return Err(EngineError::ExternalToolTimedOut {
                    tool: handle.tool.clone(),
                    secs: limit.as_secs(),
                });
            }
        }

        match handle.child.try_wait() {
            Ok(Some(status)) => exit = Some((status, Instant::now(), SystemTime::now())),
            Ok(None) => {}
            Err(err) => {
                handle.kill();
                return Err(EngineError::Io(err));
            }
        }
    };

    Ok(ProcessExit {
        code: status.code(),
        success: status.success(),
        stderr_tail,
        finished_at,
    })
}

/// Runs a process to exit and returns its full stdout alongside the exit record.
pub fn capture_output(spec: &ProcessSpec, control: RunControl<'_>) -> Result<(String, ProcessExit)> {
    let handle = spawn(spec)?;
    let mut stdout = String::new();
    let exit = run_to_completion(handle, control, |chunk| {
        if chunk.stream == OutputStream::Stdout {
            stdout.push_str(&chunk.text);
        }
    })?;
    Ok((stdout, exit))
}

fn spawn_reader<R>(mut reader: R, stream: OutputStream, tx: Sender<OutputChunk>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = vec![0_u8; READ_BUF_BYTES];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            pending.extend_from_slice(&buf[..n]);
            let text = take_decoded(&mut pending);
            if text.is_empty() {
                continue;
            }
            if tx.send(OutputChunk { stream, text }).is_err() {
                return;
            }
        }
        if !pending.is_empty() {
            let text = String::from_utf8_lossy(&pending).into_owned();
            let _ = tx.send(OutputChunk { stream, text });
        }
    });
}

/// Decodes the valid UTF-8 prefix of `pending`, keeping an incomplete trailing sequence.
fn take_decoded(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let out = text.to_string();
            pending.clear();
            out
        }
        Err(err) if err.error_len().is_none() => {
            let rest = pending.split_off(err.valid_up_to());
            let head = std::mem::replace(pending, rest);
            String::from_utf8_lossy(&head).into_owned()
        }
        Err(_) => {
            let out = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            out
        }
    }
}

fn push_tail(tail: &mut String, text: &str) {
    tail.push_str(text);
    if tail.len() > STDERR_TAIL_BYTES {
        let mut cut = tail.len() - STDERR_TAIL_BYTES;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}
