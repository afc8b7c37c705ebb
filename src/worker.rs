//! Analyze and download workers.
//!
//! A worker runs on a blocking thread, talks to the fetch capability and
//! reports through the event channel. Whatever happens inside, the task ends
//! with exactly one outcome event followed by `WorkerDone`.

use anyhow::{Context, Result};
use std::any::Any;
use std::collections::BTreeSet;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

use crate::cancel::CancellationToken;
use crate::constants::constants;
use crate::event::{Event, EventSender, FormatOption, MediaKind};
use crate::fetch::{FetchError, FetchOptions, FormatInfo, MediaFetcher, MediaMetadata, Produced};
use crate::progress::ProgressForwarder;
use crate::sanitize::rename_produced;

/// Format id of the synthetic audio-only option.
pub const AUDIO_ONLY: &str = "audio-only";
/// Format id used when no quality was picked.
pub const BEST: &str = "best";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzeTask {
  pub url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadExtras {
  pub write_thumbnail: bool,
  pub write_subtitles: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
  pub url: String,
  /// `audio-only`, `<height>p`, `best`, or a raw fetcher format selector.
  pub format_id: String,
  pub playlist: bool,
  pub destination: PathBuf,
  pub cookie_payload: Option<String>,
  pub extras: DownloadExtras,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
  Analyze(AnalyzeTask),
  Download(DownloadTask),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
  Analyze,
  Download,
}

impl Task {
  pub fn kind(&self) -> TaskKind {
    match self {
      Task::Analyze(_) => TaskKind::Analyze,
      Task::Download(_) => TaskKind::Download,
    }
  }

  pub fn url(&self) -> &str {
    match self {
      Task::Analyze(t) => &t.url,
      Task::Download(t) => &t.url,
    }
  }
}

// --- Format options ---

/// Selectable qualities: audio-only first, then distinct heights, highest first.
/// Video-only streams are dropped when they cannot be merged with an audio track.
pub fn build_format_options(formats: &[FormatInfo], can_mux: bool) -> Vec<FormatOption> {
  let heights: BTreeSet<u32> =
    formats.iter().filter(|f| f.has_video && (can_mux || f.has_audio)).filter_map(|f| f.height).collect();

  let has_m4a = formats.iter().any(|f| !f.has_video && f.ext == "m4a");
  let audio_label = if has_m4a { "Audio only (m4a)" } else { "Audio only" };
  let mut options = vec![FormatOption { id: AUDIO_ONLY.to_string(), label: audio_label.to_string(), height: None }];
  options.extend(
    heights.into_iter().rev().map(|h| FormatOption { id: format!("{h}p"), label: format!("{h}p"), height: Some(h) }),
  );
  options
}

fn parse_height(format_id: &str) -> Option<u32> {
  format_id.strip_suffix('p')?.parse().ok()
}

/// Map a format id to the selector handed to the fetcher.
pub fn format_selector(format_id: &str, can_mux: bool) -> String {
  if format_id == AUDIO_ONLY {
    return "bestaudio[ext=m4a]/bestaudio/best".to_string();
  }
  if format_id == BEST {
    let selector = if can_mux { "bestvideo*+bestaudio/best" } else { "best[ext=mp4]/best" };
    return selector.to_string();
  }
  match parse_height(format_id) {
    Some(h) if can_mux => format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]"),
    Some(h) => format!("best[height<={h}][acodec!=none]/best[height<={h}]"),
    None => format_id.to_string(),
  }
}

pub fn media_kind(format_id: &str) -> MediaKind {
  if format_id == AUDIO_ONLY { MediaKind::Audio } else { MediaKind::Video }
}

// --- Task bodies ---

/// Text of a panic payload.
pub fn describe_panic(payload: &(dyn Any + Send)) -> String {
  payload
    .downcast_ref::<&str>()
    .map(|s| s.to_string())
    .or_else(|| payload.downcast_ref::<String>().cloned())
    .unwrap_or_else(|| "unknown fault".to_string())
}

/// Run a task body at the worker boundary: a panic becomes a `Log` plus an
/// `Error`, the outcome is pushed, and `WorkerDone` always comes last.
pub fn run_guarded(tx: &EventSender, body: impl FnOnce() -> Event) {
  let outcome = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
    let message = describe_panic(payload.as_ref());
    error!(message = %message, "worker: task panicked");
    tx.push(Event::log(format!("Worker fault: {message}")));
    Event::error(format!("Unexpected error: {message}"))
  });
  debug_assert!(outcome.is_terminal(), "worker produced a non-terminal outcome: {outcome:?}");
  tx.push(outcome);
  tx.push(Event::WorkerDone);
}

/// Metadata-only pass. Returns the outcome event.
pub fn run_analyze(fetcher: &dyn MediaFetcher, task: &AnalyzeTask, tx: &EventSender) -> Event {
  info!(url = %task.url, "worker: analyzing");
  match analyze(fetcher, task, tx) {
    Ok(event) => event,
    Err(e) => {
      warn!(url = %task.url, err = %e, "worker: analyze failed");
      Event::error(format!("Analyze failed: {e}"))
    }
  }
}

fn analyze(fetcher: &dyn MediaFetcher, task: &AnalyzeTask, tx: &EventSender) -> Result<Event, FetchError> {
  let options = FetchOptions { allow_playlist: true, ..FetchOptions::for_url(&task.url) };
  let metadata = fetcher.analyze_metadata(&task.url, &options)?;
  let is_playlist = metadata.is_collection();

  let formats = match metadata.entries.as_deref().and_then(<[MediaMetadata]>::first) {
    Some(first) => representative_formats(fetcher, first, tx),
    None => metadata.formats,
  };

  let can_mux = fetcher.can_mux();
  if !can_mux {
    tx.push(Event::log("ffmpeg not found: only formats with built-in audio are offered"));
  }
  let format_options = build_format_options(&formats, can_mux);
  info!(title = %metadata.title, is_playlist, options = format_options.len(), "worker: analyze done");
  Ok(Event::AnalyzeDone { title: metadata.title, is_playlist, format_options })
}

/// Formats of a playlist's first item, falling back to the flat listing's
/// truncated metadata when the item itself cannot be analyzed.
fn representative_formats(fetcher: &dyn MediaFetcher, first: &MediaMetadata, tx: &EventSender) -> Vec<FormatInfo> {
  let Some(url) = first.url.as_deref() else { return first.formats.clone() };
  match fetcher.analyze_metadata(url, &FetchOptions::for_url(url)) {
    Ok(full) => full.formats,
    Err(e) => {
      warn!(url, err = %e, "worker: first playlist item unavailable, using listing metadata");
      tx.push(Event::log(format!("Could not inspect first playlist item: {e}")));
      first.formats.clone()
    }
  }
}

/// Write the cookie jar to a private temp file that is removed when dropped.
fn write_cookie_file(payload: &str) -> Result<NamedTempFile> {
  let mut file = tempfile::Builder::new()
    .prefix("hustdl-cookies-")
    .suffix(".txt")
    .tempfile()
    .context("Failed to create cookie file")?;
  file.write_all(payload.as_bytes()).context("Failed to write cookie file")?;
  file.flush().context("Failed to write cookie file")?;
  Ok(file)
}

/// Download pass. `token` is only checked inside the progress callback.
pub fn run_download(
  fetcher: &dyn MediaFetcher,
  task: &DownloadTask,
  token: &CancellationToken,
  tx: &EventSender,
) -> Event {
  if let Err(e) = std::fs::create_dir_all(&task.destination) {
    warn!(dir = %task.destination.display(), err = %e, "worker: destination unavailable");
    return Event::error(format!("Cannot use folder {}: {e}", task.destination.display()));
  }

  // Lives until the end of this function, so it is removed on every exit path.
  let cookie_file = match task.cookie_payload.as_deref().filter(|p| !p.trim().is_empty()) {
    Some(payload) => match write_cookie_file(payload) {
      Ok(file) => Some(file),
      Err(e) => return Event::error(format!("{e:#}")),
    },
    None => None,
  };

  let can_mux = fetcher.can_mux();
  let mut options = FetchOptions::for_url(&task.url).with_output_dir(&task.destination);
  options.allow_playlist = task.playlist;
  options.format_selector = Some(format_selector(&task.format_id, can_mux));
  options.cookie_file_path = cookie_file.as_ref().map(|f| f.path().to_path_buf());
  options.write_thumbnail = task.extras.write_thumbnail;
  if task.extras.write_subtitles {
    options.subtitle_languages = constants().subtitle_languages.clone();
  }

  info!(url = %task.url, format = %task.format_id, dir = %task.destination.display(), "worker: downloading");
  let mut sink = ProgressForwarder::new(token, tx);
  match fetcher.fetch_and_save(&task.url, &options, &mut sink) {
    Ok(produced) => finish_download(produced, task, tx),
    Err(FetchError::Cancelled) => {
      info!(url = %task.url, "worker: download cancelled");
      Event::Cancelled
    }
    Err(e) => {
      warn!(url = %task.url, err = %e, "worker: download failed");
      Event::error(format!("Download failed: {e}"))
    }
  }
}

/// Rename every produced file. Earlier playlist items are reported as `Log`
/// lines; the last one is the task's `Finished`.
fn finish_download(produced: Vec<Produced>, task: &DownloadTask, tx: &EventSender) -> Event {
  let max_len = constants().max_title_len;
  let mut saved: Vec<(PathBuf, String)> =
    produced.into_iter().map(|item| (rename_produced(&item.path, max_len), item.title)).collect();
  let Some((final_path, title)) = saved.pop() else {
    warn!(url = %task.url, "worker: fetcher reported success without a file");
    return Event::error("Download failed: no file was produced");
  };
  for (path, _) in &saved {
    tx.push(Event::log(format!("Saved {}", path.display())));
  }
  info!(path = %final_path.display(), files = saved.len() + 1, "worker: download finished");
  Event::Finished { title, final_path, media_kind: media_kind(&task.format_id) }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event::event_channel;
  use crate::fetch::testing::ScriptedFetcher;

  const URL: &str = "https://youtu.be/abc123";

  fn format(id: &str, height: Option<u32>, has_audio: bool) -> FormatInfo {
    FormatInfo { id: id.to_string(), height, ext: "mp4".to_string(), has_audio, has_video: height.is_some() }
  }

  fn video() -> MediaMetadata {
    MediaMetadata {
      title: "Clip".to_string(),
      url: Some(URL.to_string()),
      entries: None,
      formats: vec![
        format("140", None, true),
        format("137", Some(1080), false),
        format("22", Some(720), true),
        format("18", Some(360), true),
        format("134", Some(360), false),
      ],
    }
  }

  fn ids(options: &[FormatOption]) -> Vec<&str> {
    options.iter().map(|o| o.id.as_str()).collect()
  }

  /// One outcome, then exactly one `WorkerDone`, nothing after it.
  fn assert_well_formed(events: &[Event]) {
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1, "events: {events:?}");
    assert_eq!(events.iter().filter(|e| **e == Event::WorkerDone).count(), 1);
    assert_eq!(events.last(), Some(&Event::WorkerDone));
    assert!(events[events.len() - 2].is_terminal());
  }

  fn download(dir: &std::path::Path) -> DownloadTask {
    DownloadTask {
      url: URL.to_string(),
      format_id: "720p".to_string(),
      playlist: false,
      destination: dir.to_path_buf(),
      cookie_payload: None,
      extras: DownloadExtras::default(),
    }
  }

  fn run_download_task(fetcher: &ScriptedFetcher, task: &DownloadTask, token: &CancellationToken) -> Vec<Event> {
    let (tx, rx) = event_channel(256);
    run_guarded(&tx, || run_download(fetcher, task, token, &tx));
    rx.drain()
  }

  fn run_analyze_task(fetcher: &ScriptedFetcher, url: &str) -> Vec<Event> {
    let (tx, rx) = event_channel(256);
    run_guarded(&tx, || run_analyze(fetcher, &AnalyzeTask { url: url.to_string() }, &tx));
    rx.drain()
  }

  // --- format options ---

  #[test]
  fn options_are_deduplicated_and_descending() {
    let options = build_format_options(&video().formats, true);
    assert_eq!(ids(&options), ["audio-only", "1080p", "720p", "360p"]);
    assert_eq!(options[1].height, Some(1080));
  }

  #[test]
  fn video_only_formats_need_muxing() {
    let options = build_format_options(&video().formats, false);
    assert_eq!(ids(&options), ["audio-only", "720p", "360p"]);
  }

  #[test]
  fn no_formats_still_offers_audio() {
    assert_eq!(ids(&build_format_options(&[], true)), ["audio-only"]);
  }

  #[test]
  fn selectors() {
    assert_eq!(format_selector(AUDIO_ONLY, true), "bestaudio[ext=m4a]/bestaudio/best");
    assert_eq!(format_selector("720p", true), "bestvideo[height<=720]+bestaudio/best[height<=720]");
    assert_eq!(format_selector("720p", false), "best[height<=720][acodec!=none]/best[height<=720]");
    assert_eq!(format_selector(BEST, false), "best[ext=mp4]/best");
    assert_eq!(format_selector("137+140", false), "137+140");
  }

  #[test]
  fn media_kind_follows_audio_sentinel() {
    assert_eq!(media_kind(AUDIO_ONLY), MediaKind::Audio);
    assert_eq!(media_kind("1080p"), MediaKind::Video);
  }

  // --- analyze ---

  #[test]
  fn analyze_single_video() {
    let fetcher = ScriptedFetcher::default().with_metadata(URL, video());
    let events = run_analyze_task(&fetcher, URL);
    assert_well_formed(&events);
    match &events[0] {
      Event::AnalyzeDone { title, is_playlist, format_options } => {
        assert_eq!(title, "Clip");
        assert!(!is_playlist);
        assert_eq!(ids(format_options), ["audio-only", "1080p", "720p", "360p"]);
      }
      other => panic!("unexpected {other:?}"),
    }
    assert!(fetcher.last_options().unwrap().allow_playlist);
  }

  #[test]
  fn analyze_without_ffmpeg_logs_and_filters() {
    let fetcher = ScriptedFetcher { mux: false, ..ScriptedFetcher::default() }.with_metadata(URL, video());
    let events = run_analyze_task(&fetcher, URL);
    assert_well_formed(&events);
    assert!(matches!(&events[0], Event::Log { message } if message.contains("ffmpeg")));
    assert!(matches!(&events[1], Event::AnalyzeDone { format_options, .. } if format_options.len() == 3));
  }

  fn playlist() -> MediaMetadata {
    let first = MediaMetadata { title: "First".to_string(), url: Some(URL.to_string()), ..MediaMetadata::default() };
    MediaMetadata { title: "Mix".to_string(), entries: Some(vec![first]), ..MediaMetadata::default() }
  }

  #[test]
  fn analyze_playlist_uses_first_item_formats() {
    let list = "https://www.youtube.com/playlist?list=PL1";
    let fetcher = ScriptedFetcher::default().with_metadata(list, playlist()).with_metadata(URL, video());
    let events = run_analyze_task(&fetcher, list);
    assert_well_formed(&events);
    match &events[0] {
      Event::AnalyzeDone { title, is_playlist, format_options } => {
        assert_eq!(title, "Mix");
        assert!(is_playlist);
        assert_eq!(format_options.len(), 4);
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn analyze_playlist_tolerates_first_item_failure() {
    let list = "https://www.youtube.com/playlist?list=PL1";
    let fetcher =
      ScriptedFetcher::default().with_metadata(list, playlist()).with_failing_metadata(URL, "Private video");
    let events = run_analyze_task(&fetcher, list);
    assert_well_formed(&events);
    assert!(matches!(&events[0], Event::Log { message } if message.contains("Private video")));
    assert!(matches!(
      &events[1],
      Event::AnalyzeDone { is_playlist: true, format_options, .. } if ids(format_options) == ["audio-only"]
    ));
  }

  #[test]
  fn analyze_failure_is_an_error_event() {
    let fetcher = ScriptedFetcher::default();
    let events = run_analyze_task(&fetcher, "https://example.com/nothing");
    assert_well_formed(&events);
    let Event::Error { message } = &events[0] else { panic!("unexpected {:?}", events[0]) };
    assert!(message.starts_with("Analyze failed") && message.contains("Unsupported URL"));
  }

  // --- download ---

  #[test]
  fn download_finishes_with_renamed_path() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher {
      ticks: vec![10.0, 45.0, 80.0],
      produced_names: vec!["Amãzing Vidéo!!! clip-aBc12345XY.mp4".to_string()],
      ..ScriptedFetcher::default()
    };
    let events = run_download_task(&fetcher, &download(dir.path()), &CancellationToken::new());
    assert_well_formed(&events);

    let progress: Vec<f64> = events
      .iter()
      .filter_map(|e| if let Event::Progress { percent, .. } = e { Some(*percent) } else { None })
      .collect();
    assert_eq!(progress, [0.1, 0.45, 0.8, 1.0]);

    let expected = dir.path().join("Amazing Video clip-aBc12345XY.mp4");
    assert_eq!(
      events[events.len() - 2],
      Event::Finished { title: "Clip".to_string(), final_path: expected.clone(), media_kind: MediaKind::Video }
    );
    assert!(expected.exists());

    let options = fetcher.last_options().unwrap();
    assert_eq!(options.format_selector.as_deref(), Some("bestvideo[height<=720]+bestaudio/best[height<=720]"));
    assert!(!options.allow_playlist);
    assert!(options.remove_sponsored_segments);
    assert!(options.subtitle_languages.is_empty());
  }

  #[test]
  fn playlist_renames_every_item() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher {
      produced_names: vec!["Fïrst!!-a1.mp4".to_string(), "Sécond??-b2.mp4".to_string(), "Thïrd-c3.mp4".to_string()],
      ..ScriptedFetcher::default()
    };
    let mut task = download(dir.path());
    task.playlist = true;
    let events = run_download_task(&fetcher, &task, &CancellationToken::new());
    assert_well_formed(&events);

    let saved: Vec<&str> = events
      .iter()
      .filter_map(|e| if let Event::Log { message } = e { Some(message.as_str()) } else { None })
      .collect();
    assert_eq!(
      saved,
      [
        format!("Saved {}", dir.path().join("First-a1.mp4").display()),
        format!("Saved {}", dir.path().join("Second-b2.mp4").display()),
      ]
    );
    let last = dir.path().join("Third-c3.mp4");
    assert_eq!(
      events[events.len() - 2],
      Event::Finished { title: "Clip 3".to_string(), final_path: last.clone(), media_kind: MediaKind::Video }
    );
    for name in ["First-a1.mp4", "Second-b2.mp4", "Third-c3.mp4"] {
      assert!(dir.path().join(name).exists(), "{name} missing");
    }
    assert!(!dir.path().join("Fïrst!!-a1.mp4").exists());
  }

  #[test]
  fn audio_download_with_extras() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::default();
    let mut task = download(dir.path());
    task.format_id = AUDIO_ONLY.to_string();
    task.playlist = true;
    task.extras = DownloadExtras { write_thumbnail: true, write_subtitles: true };
    let events = run_download_task(&fetcher, &task, &CancellationToken::new());
    assert_well_formed(&events);
    assert!(matches!(&events[events.len() - 2], Event::Finished { media_kind: MediaKind::Audio, .. }));

    let options = fetcher.last_options().unwrap();
    assert!(options.allow_playlist && options.write_thumbnail);
    assert_eq!(options.subtitle_languages, ["vi", "en", "all"]);
  }

  #[test]
  fn cancelled_before_first_tick() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher { ticks: vec![10.0, 20.0], ..ScriptedFetcher::default() };
    let token = CancellationToken::new();
    token.cancel();
    let events = run_download_task(&fetcher, &download(dir.path()), &token);
    assert_eq!(events, [Event::Cancelled, Event::WorkerDone]);
  }

  #[test]
  fn fetch_failure_is_an_error_event() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher { fail_with: Some("HTTP Error 403".to_string()), ..ScriptedFetcher::default() };
    let events = run_download_task(&fetcher, &download(dir.path()), &CancellationToken::new());
    assert_well_formed(&events);
    assert!(matches!(&events[0], Event::Error { message } if message.contains("HTTP Error 403")));
  }

  #[test]
  fn panic_is_contained() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher { panic_message: Some("decoder exploded".to_string()), ..ScriptedFetcher::default() };
    let events = run_download_task(&fetcher, &download(dir.path()), &CancellationToken::new());
    assert_well_formed(&events);
    assert!(matches!(&events[0], Event::Log { message } if message.contains("decoder exploded")));
    assert!(matches!(&events[1], Event::Error { message } if message.contains("decoder exploded")));
  }

  #[test]
  fn panic_payload_text() {
    assert_eq!(describe_panic(&"static text"), "static text");
    assert_eq!(describe_panic(&format!("code {}", 7)), "code 7");
    assert_eq!(describe_panic(&42u8), "unknown fault");
  }

  #[test]
  fn cookie_file_is_removed_after_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher { fail_with: Some("boom".to_string()), ..ScriptedFetcher::default() };
    let mut task = download(dir.path());
    task.cookie_payload = Some("# Netscape HTTP Cookie File\n".to_string());
    run_download_task(&fetcher, &task, &CancellationToken::new());

    let cookie_path = fetcher.last_options().unwrap().cookie_file_path.expect("cookie file passed");
    assert!(!cookie_path.exists());
  }

  #[test]
  fn blank_cookie_payload_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::default();
    let mut task = download(dir.path());
    task.cookie_payload = Some("   ".to_string());
    run_download_task(&fetcher, &task, &CancellationToken::new());
    assert_eq!(fetcher.last_options().unwrap().cookie_file_path, None);
  }

  #[test]
  fn unusable_destination_short_circuits() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"x").unwrap();
    let fetcher = ScriptedFetcher::default();
    let events = run_download_task(&fetcher, &download(&blocker.join("sub")), &CancellationToken::new());
    assert_well_formed(&events);
    assert!(matches!(&events[0], Event::Error { message } if message.starts_with("Cannot use folder")));
    assert!(fetcher.last_options().is_none());
  }
}
