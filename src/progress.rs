use std::time::{Duration, Instant};
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::constants::constants;
use crate::event::{Event, EventSender};
use crate::fetch::{ProgressControl, ProgressSink, ProgressStatus, ProgressUpdate};

/// Rate limiter for progress events. Only the latest state matters for display,
/// so rejected updates are simply dropped.
#[derive(Debug)]
pub struct Coalescer {
  min_delta: f64,
  min_interval: Duration,
  last: Option<(f64, Instant)>,
}

impl Default for Coalescer {
  fn default() -> Self {
    let c = constants();
    Self::with_thresholds(c.progress_min_delta, c.progress_min_interval())
  }
}

impl Coalescer {
  pub fn with_thresholds(min_delta: f64, min_interval: Duration) -> Self {
    Self { min_delta, min_interval, last: None }
  }

  /// Whether `percent` observed at `now` should be forwarded. The first update always is.
  pub fn admit(&mut self, percent: f64, now: Instant) -> bool {
    let admit = match self.last {
      None => true,
      Some((last_percent, last_time)) => {
        let elapsed = now.saturating_duration_since(last_time);
        (percent - last_percent).abs() >= self.min_delta || elapsed >= self.min_interval
      }
    };
    if admit {
      self.last = Some((percent, now));
    }
    admit
  }
}

/// Parse fetcher percent text like `" 45.3%"` into a fraction in `0.0..=1.0`.
pub fn parse_percent(text: &str) -> Option<f64> {
  let number = text.trim().trim_end_matches('%').trim();
  let value: f64 = number.parse().ok()?;
  if !value.is_finite() {
    return None;
  }
  Some((value / 100.0).clamp(0.0, 1.0))
}

fn label(text: &str) -> String {
  let text = text.trim();
  if text == "NA" || text == "Unknown" { String::new() } else { text.to_string() }
}

/// Progress callback handed to the fetcher by a download worker.
///
/// Every invocation checks the cancellation token first. The fetcher also asks
/// [`ProgressSink::should_abort`] while it is silent, so a cancel lands during
/// merging too.
pub struct ProgressForwarder<'a> {
  token: &'a CancellationToken,
  tx: &'a EventSender,
  coalescer: Coalescer,
}

impl<'a> ProgressForwarder<'a> {
  pub fn new(token: &'a CancellationToken, tx: &'a EventSender) -> Self {
    Self { token, tx, coalescer: Coalescer::default() }
  }
}

impl ProgressSink for ProgressForwarder<'_> {
  fn on_progress(&mut self, update: &ProgressUpdate) -> ProgressControl {
    if self.token.is_cancelled() {
      return ProgressControl::Abort;
    }
    let percent = match update.status {
      ProgressStatus::Finished => {
        debug!(file = ?update.filename, "worker: fetcher finished a file");
        Some(1.0)
      }
      ProgressStatus::Downloading => parse_percent(&update.percent_text),
    };
    let Some(percent) = percent else { return ProgressControl::Continue };

    if self.coalescer.admit(percent, Instant::now()) {
      self.tx.push(Event::Progress {
        percent,
        speed_label: label(&update.speed_text),
        eta_label: label(&update.eta_text),
      });
    }
    ProgressControl::Continue
  }

  fn should_abort(&mut self) -> bool {
    self.token.is_cancelled()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event::event_channel;

  fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
  }

  // --- parse_percent ---

  #[test]
  fn parses_padded_percent() {
    assert_eq!(parse_percent(" 45.0%"), Some(0.45));
    assert_eq!(parse_percent("100%"), Some(1.0));
  }

  #[test]
  fn rejects_garbage() {
    assert_eq!(parse_percent("NA"), None);
    assert_eq!(parse_percent(""), None);
    assert_eq!(parse_percent("nan%"), None);
  }

  #[test]
  fn clamps_out_of_range() {
    assert_eq!(parse_percent("150%"), Some(1.0));
    assert_eq!(parse_percent("-3%"), Some(0.0));
  }

  // --- Coalescer ---

  #[test]
  fn first_update_always_passes() {
    let mut c = Coalescer::with_thresholds(0.005, ms(200));
    assert!(c.admit(0.0, Instant::now()));
  }

  #[test]
  fn small_fast_updates_are_dropped() {
    let t0 = Instant::now();
    let mut c = Coalescer::with_thresholds(0.005, ms(200));
    assert!(c.admit(0.100, t0));
    assert!(!c.admit(0.101, t0 + ms(50)));
    assert!(!c.admit(0.103, t0 + ms(100)));
  }

  #[test]
  fn large_jump_passes_immediately() {
    let t0 = Instant::now();
    let mut c = Coalescer::with_thresholds(0.005, ms(200));
    assert!(c.admit(0.10, t0));
    assert!(c.admit(0.11, t0 + ms(1)));
  }

  #[test]
  fn elapsed_interval_passes_small_change() {
    let t0 = Instant::now();
    let mut c = Coalescer::with_thresholds(0.005, ms(200));
    assert!(c.admit(0.10, t0));
    assert!(c.admit(0.101, t0 + ms(200)));
  }

  #[test]
  fn forwarded_updates_respect_thresholds() {
    let t0 = Instant::now();
    let mut c = Coalescer::with_thresholds(0.005, ms(200));
    let mut forwarded = Vec::new();
    // Dense callback stream: 0.1% every 7ms.
    for i in 0..1000u64 {
      let (percent, at) = (i as f64 * 0.001, t0 + ms(i * 7));
      if c.admit(percent, at) {
        forwarded.push((percent, at));
      }
    }
    assert!(forwarded.len() < 1000);
    for pair in forwarded.windows(2) {
      let (p0, t_0) = pair[0];
      let (p1, t_1) = pair[1];
      assert!((p1 - p0).abs() >= 0.005 - 1e-9 || t_1 - t_0 >= ms(200));
    }
  }

  // --- ProgressForwarder ---

  fn update(status: ProgressStatus, percent: &str) -> ProgressUpdate {
    ProgressUpdate {
      status,
      percent_text: percent.to_string(),
      speed_text: " 2.00MiB/s".to_string(),
      eta_text: "NA".to_string(),
      filename: None,
    }
  }

  #[test]
  fn forwards_progress_events() {
    let (tx, rx) = event_channel(16);
    let token = CancellationToken::new();
    let mut sink = ProgressForwarder::new(&token, &tx);
    assert_eq!(sink.on_progress(&update(ProgressStatus::Downloading, " 10.0%")), ProgressControl::Continue);
    assert_eq!(
      rx.drain(),
      [Event::Progress { percent: 0.1, speed_label: "2.00MiB/s".to_string(), eta_label: String::new() }]
    );
  }

  #[test]
  fn finished_status_reports_full() {
    let (tx, rx) = event_channel(16);
    let token = CancellationToken::new();
    let mut sink = ProgressForwarder::new(&token, &tx);
    sink.on_progress(&update(ProgressStatus::Finished, "NA"));
    assert!(matches!(rx.drain().as_slice(), [Event::Progress { percent, .. }] if *percent == 1.0));
  }

  #[test]
  fn unparsable_percent_is_ignored() {
    let (tx, rx) = event_channel(16);
    let token = CancellationToken::new();
    let mut sink = ProgressForwarder::new(&token, &tx);
    assert_eq!(sink.on_progress(&update(ProgressStatus::Downloading, "Unknown")), ProgressControl::Continue);
    assert!(rx.is_empty());
  }

  #[test]
  fn cancelled_token_aborts_without_event() {
    let (tx, rx) = event_channel(16);
    let token = CancellationToken::new();
    token.cancel();
    let mut sink = ProgressForwarder::new(&token, &tx);
    assert_eq!(sink.on_progress(&update(ProgressStatus::Downloading, " 46.0%")), ProgressControl::Abort);
    assert!(rx.is_empty());
  }

  #[test]
  fn idle_poll_follows_token() {
    let (tx, rx) = event_channel(16);
    let token = CancellationToken::new();
    let mut sink = ProgressForwarder::new(&token, &tx);
    assert!(!sink.should_abort());
    token.cancel();
    assert!(sink.should_abort());
    assert!(rx.is_empty());
  }
}
