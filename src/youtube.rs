use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use serde::Deserialize;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::constants::constants;
use crate::fetch::{
  FetchError, FetchOptions, FormatInfo, MediaFetcher, MediaMetadata, Produced, ProgressControl, ProgressSink,
  ProgressStatus, ProgressUpdate,
};

/// Markers prefixed to our own stdout lines so they can be told apart.
const PROGRESS_MARKER: &str = "[hustdl]";
const PATH_MARKER: &str = "[hustdl:path]";
const TITLE_MARKER: &str = "[hustdl:title]";

/// The yt-dlp progress template: `status|percent|speed|eta|filename`.
const PROGRESS_TEMPLATE: &str = "download:[hustdl]%(progress.status)s|%(progress._percent_str)s|%(progress._speed_str)s|%(progress._eta_str)s|%(progress.filename)s";

// --- JSON model (subset of `yt-dlp -J`) ---

#[derive(Debug, Deserialize)]
struct RawInfo {
  title: Option<String>,
  id: Option<String>,
  url: Option<String>,
  webpage_url: Option<String>,
  entries: Option<Vec<Option<RawInfo>>>,
  #[serde(default)]
  formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
  format_id: String,
  height: Option<u32>,
  ext: Option<String>,
  acodec: Option<String>,
  vcodec: Option<String>,
}

impl From<RawFormat> for FormatInfo {
  fn from(raw: RawFormat) -> Self {
    // A missing codec field means "unknown", not "none".
    let has_audio = raw.acodec.as_deref() != Some("none");
    let has_video = raw.vcodec.as_deref() != Some("none") && raw.height.is_some();
    FormatInfo { id: raw.format_id, height: raw.height, ext: raw.ext.unwrap_or_default(), has_audio, has_video }
  }
}

impl From<RawInfo> for MediaMetadata {
  fn from(raw: RawInfo) -> Self {
    let title = raw.title.or(raw.id).unwrap_or_else(|| "Unknown".to_string());
    MediaMetadata {
      title,
      url: raw.webpage_url.or(raw.url),
      entries: raw.entries.map(|entries| entries.into_iter().flatten().map(MediaMetadata::from).collect()),
      formats: raw.formats.into_iter().map(FormatInfo::from).collect(),
    }
  }
}

fn parse_metadata(json: &str) -> Result<MediaMetadata, FetchError> {
  serde_json::from_str::<RawInfo>(json)
    .map(MediaMetadata::from)
    .map_err(|e| FetchError::Extraction(format!("unreadable yt-dlp metadata: {e}")))
}

/// Parse the part of a progress line after [`PROGRESS_MARKER`].
fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
  let mut parts = line.splitn(5, '|');
  let status = match parts.next()?.trim() {
    "downloading" => ProgressStatus::Downloading,
    "finished" => ProgressStatus::Finished,
    _ => return None,
  };
  let mut field = || parts.next().map(str::trim).filter(|s| !s.is_empty() && *s != "NA").unwrap_or("").to_string();
  let percent_text = field();
  let speed_text = field();
  let eta_text = field();
  let filename = Some(field()).filter(|s| !s.is_empty()).map(PathBuf::from);
  Some(ProgressUpdate { status, percent_text, speed_text, eta_text, filename })
}

/// Turn a failed run's stderr into a typed error, keeping the most relevant line.
fn classify_failure(stderr: &str) -> FetchError {
  let message = stderr
    .lines()
    .rev()
    .map(str::trim)
    .find(|l| l.starts_with("ERROR:"))
    .or_else(|| stderr.lines().rev().map(str::trim).find(|l| !l.is_empty()))
    .unwrap_or("yt-dlp exited with an error")
    .trim_start_matches("ERROR:")
    .trim()
    .to_string();

  let lower = message.to_lowercase();
  let network = ["unable to download", "http error", "timed out", "connection", "network is unreachable", "ssl"];
  if network.iter().any(|needle| lower.contains(needle)) {
    FetchError::Network(message)
  } else {
    FetchError::Extraction(message)
  }
}

fn spawn_error(program: &str, e: std::io::Error) -> FetchError {
  if e.kind() == std::io::ErrorKind::NotFound {
    FetchError::ToolMissing { program: program.to_string() }
  } else {
    FetchError::Io(e)
  }
}

/// Args shared by metadata and download runs.
fn common_args(options: &FetchOptions) -> Vec<String> {
  let mut args = vec![
    "--no-warnings".to_string(),
    "--retries".to_string(),
    options.retry_count.to_string(),
    "--socket-timeout".to_string(),
    options.socket_timeout_seconds.to_string(),
    (if options.allow_playlist { "--yes-playlist" } else { "--no-playlist" }).to_string(),
  ];
  if let Some(agent) = &options.user_agent {
    args.extend(["--user-agent".to_string(), agent.clone()]);
    args.extend(["--add-header".to_string(), "Accept-Language:en-US,en;q=0.9".to_string()]);
  }
  if let Some(cookies) = &options.cookie_file_path {
    args.extend(["--cookies".to_string(), cookies.to_string_lossy().to_string()]);
  }
  args
}

fn download_args(url: &str, options: &FetchOptions) -> Vec<String> {
  let mut args = common_args(options);
  if options.quiet_output {
    args.push("--quiet".to_string());
  }
  args.extend([
    "--progress".to_string(),
    "--newline".to_string(),
    "--progress-template".to_string(),
    PROGRESS_TEMPLATE.to_string(),
    "--print".to_string(),
    format!("after_move:{TITLE_MARKER}%(title)s"),
    "--print".to_string(),
    format!("after_move:{PATH_MARKER}%(filepath)s"),
    "--no-simulate".to_string(),
  ]);
  if let Some(template) = &options.output_path_template {
    args.extend(["-o".to_string(), template.to_string_lossy().to_string()]);
  }
  if let Some(selector) = &options.format_selector {
    args.extend(["-f".to_string(), selector.clone()]);
  }
  if options.remove_sponsored_segments {
    args.extend(["--sponsorblock-remove".to_string(), "sponsor".to_string()]);
  }
  if options.write_thumbnail {
    args.push("--write-thumbnail".to_string());
  }
  if !options.subtitle_languages.is_empty() {
    args.extend(["--write-subs".to_string(), "--sub-langs".to_string(), options.subtitle_languages.join(",")]);
  }
  args.extend(["--".to_string(), url.to_string()]);
  args
}

fn drain_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
  let mut stderr = child.stderr.take()?;
  Some(std::thread::spawn(move || {
    let mut buf = Vec::new();
    let _ = stderr.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
  }))
}

/// Raw stdout lines. Bytes, so a stray non-UTF-8 line cannot end the read.
fn forward_lines(stdout: ChildStdout, tx: Sender<Vec<u8>>) {
  for line in BufReader::new(stdout).split(b'\n') {
    match line {
      Ok(line) => {
        if tx.send(line).is_err() {
          break;
        }
      }
      Err(e) => {
        warn!(err = %e, "worker: reading yt-dlp output failed");
        break;
      }
    }
  }
}

/// Own process group, so a terminal Ctrl-C reaches hustdl and not yt-dlp.
fn detach_from_terminal_signals(command: &mut Command) -> &mut Command {
  #[cfg(unix)]
  {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
  }
  #[cfg(windows)]
  {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(CREATE_NEW_PROCESS_GROUP);
  }
  command
}

fn file_stem(path: &Path) -> String {
  path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

enum Line {
  Text(String),
  Silent,
  Closed,
}

/// A running yt-dlp download. Unless [`DownloadRun::finish`] reaped it, dropping
/// the run kills and reaps the process, so no exit path leaves it behind.
struct DownloadRun {
  child: Child,
  lines: Receiver<Vec<u8>>,
  stderr: Option<JoinHandle<String>>,
  reaped: bool,
}

impl DownloadRun {
  fn spawn(program: &str, args: &[String]) -> Result<Self, FetchError> {
    let mut command = Command::new(program);
    command
      .args(args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      // Drained on its own thread: an undrained pipe fills up and blocks yt-dlp.
      .stderr(Stdio::piped());
    let mut child = detach_from_terminal_signals(&mut command).spawn().map_err(|e| spawn_error(program, e))?;
    debug!(pid = child.id(), "worker: yt-dlp spawned");

    let stderr = drain_stderr(&mut child);
    let stdout = child.stdout.take();
    let (tx, lines) = unbounded();
    let run = Self { child, lines, stderr, reaped: false };
    let stdout = stdout.ok_or_else(|| FetchError::Extraction("yt-dlp stdout unavailable".to_string()))?;
    std::thread::spawn(move || forward_lines(stdout, tx));
    Ok(run)
  }

  fn next_line(&self, wait: Duration) -> Line {
    match self.lines.recv_timeout(wait) {
      Ok(bytes) => Line::Text(String::from_utf8_lossy(&bytes).trim_end_matches('\r').to_string()),
      Err(RecvTimeoutError::Timeout) => Line::Silent,
      Err(RecvTimeoutError::Disconnected) => Line::Closed,
    }
  }

  /// Wait for yt-dlp to exit on its own and collect its stderr.
  fn finish(mut self) -> Result<(ExitStatus, String), FetchError> {
    let status = self.child.wait()?;
    self.reaped = true;
    let stderr = self.stderr.take().and_then(|h| h.join().ok()).unwrap_or_default();
    Ok((status, stderr))
  }
}

impl Drop for DownloadRun {
  fn drop(&mut self) {
    if self.reaped {
      return;
    }
    if let Err(e) = self.child.kill() {
      warn!(err = %e, "worker: failed to kill yt-dlp");
    }
    match self.child.wait() {
      Ok(status) => debug!(%status, "worker: yt-dlp stopped"),
      Err(e) => warn!(err = %e, "worker: failed to reap yt-dlp"),
    }
    // The pipe reader threads end by themselves once every writer is gone.
  }
}

/// `MediaFetcher` backed by the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlp {
  program: String,
  ffmpeg: String,
}

impl Default for YtDlp {
  fn default() -> Self {
    let c = constants();
    Self { program: c.ytdlp_program.clone(), ffmpeg: c.ffmpeg_program.clone() }
  }
}

impl YtDlp {
  pub fn new() -> Self {
    Self::default()
  }
}

impl MediaFetcher for YtDlp {
  /// Runs in the terminal's process group: analysis cannot be cancelled, so a
  /// Ctrl-C stops yt-dlp directly.
  fn analyze_metadata(&self, url: &str, options: &FetchOptions) -> Result<MediaMetadata, FetchError> {
    let mut args = common_args(options);
    args.extend(["-J".to_string(), "--flat-playlist".to_string(), "--".to_string(), url.to_string()]);
    debug!(url, "worker: yt-dlp metadata request");

    let output = Command::new(&self.program)
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .output()
      .map_err(|e| spawn_error(&self.program, e))?;

    if !output.status.success() {
      return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
    }
    parse_metadata(&String::from_utf8_lossy(&output.stdout))
  }

  fn fetch_and_save(
    &self,
    url: &str,
    options: &FetchOptions,
    progress: &mut dyn ProgressSink,
  ) -> Result<Vec<Produced>, FetchError> {
    let args = download_args(url, options);
    info!(url, format = ?options.format_selector, "worker: starting yt-dlp download");
    let run = DownloadRun::spawn(&self.program, &args)?;
    let poll = constants().abort_poll_interval();

    let mut produced = Vec::new();
    let mut title = None;
    loop {
      let line = match run.next_line(poll) {
        Line::Text(line) => line,
        Line::Silent => {
          if progress.should_abort() {
            info!(url, "worker: cancellation observed while yt-dlp was quiet, stopping it");
            return Err(FetchError::Cancelled);
          }
          continue;
        }
        Line::Closed => break,
      };
      // Each item prints its title line, then its path line.
      if let Some(rest) = line.strip_prefix(TITLE_MARKER) {
        title = Some(rest.trim().to_string());
      } else if let Some(rest) = line.strip_prefix(PATH_MARKER) {
        let path = PathBuf::from(rest.trim());
        let title = title.take().unwrap_or_else(|| file_stem(&path));
        produced.push(Produced { path, title });
      } else if let Some(rest) = line.strip_prefix(PROGRESS_MARKER)
        && let Some(update) = parse_progress_line(rest)
        && progress.on_progress(&update) == ProgressControl::Abort
      {
        info!(url, "worker: cancellation observed, stopping yt-dlp");
        return Err(FetchError::Cancelled);
      }
    }

    let (status, stderr) = run.finish()?;
    if !status.success() {
      return Err(classify_failure(&stderr));
    }
    if produced.is_empty() {
      return Err(FetchError::Extraction("yt-dlp did not report an output file".to_string()));
    }
    debug!(files = produced.len(), "worker: yt-dlp done");
    Ok(produced)
  }

  fn can_mux(&self) -> bool {
    let available = Command::new(&self.ffmpeg)
      .arg("-version")
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .status()
      .is_ok_and(|s| s.success());
    debug!(available, "worker: ffmpeg muxing capability");
    available
  }
}
