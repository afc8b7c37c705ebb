//! Tunables for the channel, coalescer, stores and yt-dlp adapter.
//!
//! `constants.ron` is compiled in with `include_str!` and parsed on first use.

use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Constants {
  pub app_name: String,

  // Event channel / consumer loop
  pub event_channel_capacity: usize,
  pub consumer_tick_ms: u64,

  // Progress coalescing
  pub progress_min_delta: f64,
  pub progress_min_interval_ms: u64,

  // Persistence
  pub history_limit: usize,

  // Filenames
  pub max_title_len: usize,
  pub max_id_len: usize,

  // yt-dlp
  pub ytdlp_program: String,
  pub ffmpeg_program: String,
  /// How long a download may stay silent before the cancel flag is rechecked.
  pub abort_poll_ms: u64,
  pub retry_count: u32,
  pub socket_timeout_secs: u32,
  pub output_template: String,
  pub user_agent: String,
  pub subtitle_languages: Vec<String>,
  pub sponsor_hosts: Vec<String>,
}

impl Constants {
  pub fn consumer_tick(&self) -> Duration {
    Duration::from_millis(self.consumer_tick_ms)
  }

  pub fn progress_min_interval(&self) -> Duration {
    Duration::from_millis(self.progress_min_interval_ms)
  }

  pub fn abort_poll_interval(&self) -> Duration {
    Duration::from_millis(self.abort_poll_ms)
  }
}

static CONSTANTS: LazyLock<Constants> = LazyLock::new(|| {
  // Embedded at build time, so a parse failure is a packaging bug.
  ron::from_str(include_str!("../constants.ron")).expect("embedded constants.ron is invalid")
});

pub fn constants() -> &'static Constants {
  &CONSTANTS
}
