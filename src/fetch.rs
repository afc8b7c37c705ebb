//! The media-fetch capability the workers drive.
//!
//! Implementations know how to talk to media sites; workers only see metadata,
//! progress callbacks and a produced file. `youtube::YtDlp` is the real one.

use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::constants::constants;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatInfo {
  pub id: String,
  pub height: Option<u32>,
  pub ext: String,
  pub has_audio: bool,
  pub has_video: bool,
}

/// Metadata for a single item or a collection. Collection members from a flat
/// listing are truncated: usually a title and url, no formats.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaMetadata {
  pub title: String,
  pub url: Option<String>,
  pub entries: Option<Vec<MediaMetadata>>,
  pub formats: Vec<FormatInfo>,
}

impl MediaMetadata {
  pub fn is_collection(&self) -> bool {
    self.entries.is_some()
  }
}

/// One artifact a successful download wrote. A playlist run yields one per item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Produced {
  pub path: PathBuf,
  pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
  Downloading,
  Finished,
}

/// One progress tick as reported by the fetcher, still in display-text form.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
  pub status: ProgressStatus,
  pub percent_text: String,
  pub speed_text: String,
  pub eta_text: String,
  pub filename: Option<PathBuf>,
}

/// Answer from a progress callback. `Abort` asks the fetcher to stop and report
/// [`FetchError::Cancelled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressControl {
  Continue,
  Abort,
}

pub trait ProgressSink {
  fn on_progress(&mut self, update: &ProgressUpdate) -> ProgressControl;

  /// Polled while the fetcher has nothing to report (merging, post-processing).
  fn should_abort(&mut self) -> bool {
    false
  }
}

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("{program} not found. Install it with: brew install {program} (macOS) or pip install {program}")]
  ToolMissing { program: String },

  #[error("extraction failed: {0}")]
  Extraction(String),

  #[error("network error: {0}")]
  Network(String),

  #[error("download cancelled")]
  Cancelled,

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Options the core sets when building fetcher calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOptions {
  pub quiet_output: bool,
  pub allow_playlist: bool,
  pub format_selector: Option<String>,
  pub output_path_template: Option<PathBuf>,
  pub cookie_file_path: Option<PathBuf>,
  pub retry_count: u32,
  pub socket_timeout_seconds: u32,
  pub remove_sponsored_segments: bool,
  pub write_thumbnail: bool,
  pub subtitle_languages: Vec<String>,
  pub user_agent: Option<String>,
}

impl FetchOptions {
  /// Baseline options for `url`; callers fill in the task-specific parts.
  pub fn for_url(url: &str) -> Self {
    let c = constants();
    Self {
      quiet_output: true,
      retry_count: c.retry_count,
      socket_timeout_seconds: c.socket_timeout_secs,
      remove_sponsored_segments: is_known_video_platform(url),
      user_agent: Some(c.user_agent.clone()),
      ..Self::default()
    }
  }

  pub fn with_output_dir(mut self, dir: &Path) -> Self {
    self.output_path_template = Some(dir.join(&constants().output_template));
    self
  }
}

/// Hosts where sponsored segments are marked and can be cut.
pub fn is_known_video_platform(url: &str) -> bool {
  let Ok(parsed) = Url::parse(url) else { return false };
  let Some(host) = parsed.host_str() else { return false };
  let host = host.trim_start_matches("www.").trim_start_matches("m.");
  constants().sponsor_hosts.iter().any(|known| host == known || host.ends_with(&format!(".{known}")))
}

/// The external media-fetch capability.
pub trait MediaFetcher: Send + Sync {
  /// Metadata only, nothing is downloaded.
  fn analyze_metadata(&self, url: &str, options: &FetchOptions) -> Result<MediaMetadata, FetchError>;

  /// Download under `options.output_path_template`. On success the list holds
  /// every file written, in order, and is never empty.
  fn fetch_and_save(
    &self,
    url: &str,
    options: &FetchOptions,
    progress: &mut dyn ProgressSink,
  ) -> Result<Vec<Produced>, FetchError>;

  /// Whether separate audio and video streams can be merged locally.
  fn can_mux(&self) -> bool;
}
