mod app;
mod cancel;
mod config;
mod constants;
mod dispatcher;
mod event;
mod fetch;
mod history;
mod progress;
mod sanitize;
mod worker;
mod youtube;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use directories::UserDirs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use app::{Consumer, Outcome, Phase, View};
use config::{Settings, SettingsStore};
use constants::constants;
use dispatcher::Dispatcher;
use event::{MediaKind, event_channel};
use history::HistoryStore;
use worker::{AUDIO_ONLY, AnalyzeTask, BEST, DownloadExtras, DownloadTask, Task};
use youtube::YtDlp;

// --- CLI ---

#[derive(Parser, Debug)]
#[command(author, version = env!("CARGO_PKG_VERSION"), about, long_about = None)]
struct Cli {
  /// Where settings, history and logs live (default: platform data directory)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show the title and available qualities of a URL
  Analyze { url: String },
  /// Download a URL; Ctrl-C cancels
  Download(DownloadArgs),
  /// List completed downloads, newest first
  History {
    /// Forget all entries
    #[arg(long)]
    clear: bool,
  },
  /// Show or change saved settings
  Settings(SettingsArgs),
}

#[derive(Args, Debug)]
struct DownloadArgs {
  url: String,
  /// Quality: 'audio-only', '<height>p' (e.g. 720p), 'best', or a raw yt-dlp selector
  #[arg(short, long)]
  format: Option<String>,
  /// Destination folder (default: the Downloads folder)
  #[arg(short, long)]
  dir: Option<PathBuf>,
  /// Download the whole playlist instead of a single item
  #[arg(long)]
  playlist: bool,
  /// Netscape cookie file to use instead of the saved cookies
  #[arg(long, value_name = "FILE")]
  cookies: Option<PathBuf>,
  /// Also save the thumbnail
  #[arg(long)]
  thumbnail: bool,
  /// Also save subtitles
  #[arg(long)]
  subtitles: bool,
}

#[derive(Args, Debug)]
struct SettingsArgs {
  /// Save the contents of this Netscape cookie file
  #[arg(long, value_name = "FILE", conflicts_with = "clear_cookies")]
  cookies: Option<PathBuf>,
  /// Forget saved cookies
  #[arg(long)]
  clear_cookies: bool,
  #[arg(long, value_name = "BOOL")]
  auto_clipboard: Option<bool>,
  /// Default quality when --format is not given
  #[arg(long)]
  mode: Option<MediaKind>,
  #[arg(long, value_name = "BOOL")]
  thumbnail: Option<bool>,
  #[arg(long, value_name = "BOOL")]
  subtitles: Option<bool>,
}

// --- Logging ---

/// Log to a daily file in the data directory so the terminal stays clean.
fn init_logging(data_dir: &Path) -> Result<WorkerGuard> {
  let log_dir = data_dir.join("logs");
  std::fs::create_dir_all(&log_dir).with_context(|| format!("Failed to create {}", log_dir.display()))?;
  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "hustdl.log"));
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Ok(guard)
}

/// Panic reports go to the log file; the terminal only shows the outcome.
fn log_panics() {
  std::panic::set_hook(Box::new(|info| {
    let location = info.location().map(|l| format!("{}:{}", l.file(), l.line())).unwrap_or_default();
    error!(message = %worker::describe_panic(info.payload()), location = %location, "hustdl: panic");
  }));
}

// --- Rendering ---

/// Prints the consumer's view as plain terminal lines.
#[derive(Default)]
struct Renderer {
  printed_log: usize,
  progress_shown: bool,
}

impl Renderer {
  fn end_progress_line(&mut self) {
    if self.progress_shown {
      println!();
      self.progress_shown = false;
    }
  }

  fn render(&mut self, view: &View) {
    if view.log.len() > self.printed_log {
      self.end_progress_line();
      for line in &view.log[self.printed_log..] {
        println!("  {line}");
      }
      self.printed_log = view.log.len();
    }

    if matches!(view.phase, Phase::Downloading | Phase::Cancelling) && view.progress > 0.0 {
      let width = 30;
      let filled = ((view.progress * width as f64).round() as usize).min(width);
      print!("\r[{}{}] {:5.1}%", "#".repeat(filled), "-".repeat(width - filled), view.progress * 100.0);
      if !view.speed_label.is_empty() {
        print!("  {}", view.speed_label);
      }
      if !view.eta_label.is_empty() {
        print!("  ETA {}", view.eta_label);
      }
      print!("   ");
      let _ = std::io::stdout().flush();
      self.progress_shown = true;
    }

    if view.phase == Phase::Idle
      && let Some(outcome) = &view.outcome
    {
      self.end_progress_line();
      println!("{}", outcome.banner());
    }
  }
}

// --- Commands ---

fn new_consumer(data_dir: &Path) -> Consumer {
  let (tx, rx) = event_channel(constants().event_channel_capacity);
  let dispatcher = Dispatcher::new(Arc::new(YtDlp::new()), tx);
  Consumer::new(rx, dispatcher, HistoryStore::open(data_dir))
}

/// Exit status after the user interrupted twice, as a shell reports SIGINT.
const INTERRUPTED: u8 = 130;

/// Resolves on the next Ctrl-C; never resolves if the handler cannot be installed.
async fn ctrl_c() {
  if tokio::signal::ctrl_c().await.is_err() {
    std::future::pending::<()>().await;
  }
}

fn exit_code(view: &View) -> ExitCode {
  match view.outcome {
    Some(Outcome::Failed(_)) => ExitCode::FAILURE,
    _ => ExitCode::SUCCESS,
  }
}

async fn analyze(data_dir: &Path, url: String) -> Result<ExitCode> {
  let mut consumer = new_consumer(data_dir);
  consumer.start(Task::Analyze(AnalyzeTask { url }))?;
  println!("Analyzing...");
  let mut renderer = Renderer::default();
  if !consumer.run(ctrl_c, |view| renderer.render(view)).await {
    return Ok(ExitCode::from(INTERRUPTED));
  }

  if let Some(analysis) = &consumer.view().analysis {
    let kind = if analysis.is_playlist { "playlist" } else { "video" };
    println!("{} ({kind})", analysis.title);
    for option in &analysis.format_options {
      println!("  {:<12} {}", option.id, option.label);
    }
  }
  Ok(exit_code(consumer.view()))
}

fn default_download_dir() -> PathBuf {
  UserDirs::new().and_then(|dirs| dirs.download_dir().map(Path::to_path_buf)).unwrap_or_else(|| PathBuf::from("."))
}

async fn download(data_dir: &Path, args: DownloadArgs) -> Result<ExitCode> {
  let settings = SettingsStore::new(data_dir).load();
  let cookie_payload = match &args.cookies {
    Some(path) => {
      Some(std::fs::read_to_string(path).with_context(|| format!("Failed to read cookie file {}", path.display()))?)
    }
    None => Some(settings.cookie_payload.clone()).filter(|p| !p.trim().is_empty()),
  };
  let format_id = args.format.unwrap_or_else(|| {
    match settings.default_mode {
      MediaKind::Audio => AUDIO_ONLY,
      MediaKind::Video => BEST,
    }
    .to_string()
  });
  let task = DownloadTask {
    url: args.url,
    format_id,
    playlist: args.playlist,
    destination: args.dir.unwrap_or_else(default_download_dir),
    cookie_payload,
    extras: DownloadExtras {
      write_thumbnail: args.thumbnail || settings.write_thumbnail,
      write_subtitles: args.subtitles || settings.write_subtitles,
    },
  };

  let mut consumer = new_consumer(data_dir);
  let destination = task.destination.clone();
  consumer.start(Task::Download(task))?;
  println!("Downloading to {} (Ctrl-C to cancel)", destination.display());
  let mut renderer = Renderer::default();
  if !consumer.run(ctrl_c, |view| renderer.render(view)).await {
    return Ok(ExitCode::from(INTERRUPTED));
  }
  Ok(exit_code(consumer.view()))
}

fn history(data_dir: &Path, clear: bool) -> Result<ExitCode> {
  let mut store = HistoryStore::open(data_dir);
  if clear {
    store.clear()?;
    println!("History cleared");
    return Ok(ExitCode::SUCCESS);
  }
  if store.entries().is_empty() {
    println!("No downloads yet");
  }
  for entry in store.entries() {
    println!("{}  {:<5}  {}", entry.timestamp.format("%Y-%m-%d %H:%M"), entry.media_kind.label(), entry.title);
    println!("    {}", entry.final_path.display());
  }
  Ok(ExitCode::SUCCESS)
}

fn settings(data_dir: &Path, args: SettingsArgs) -> Result<ExitCode> {
  let store = SettingsStore::new(data_dir);
  let mut settings = store.load();
  let before = settings.clone();

  if let Some(path) = &args.cookies {
    settings.cookie_payload =
      std::fs::read_to_string(path).with_context(|| format!("Failed to read cookie file {}", path.display()))?;
  }
  if args.clear_cookies {
    settings.cookie_payload.clear();
  }
  if let Some(value) = args.auto_clipboard {
    settings.auto_capture_clipboard = value;
  }
  if let Some(mode) = args.mode {
    settings.default_mode = mode;
  }
  if let Some(value) = args.thumbnail {
    settings.write_thumbnail = value;
  }
  if let Some(value) = args.subtitles {
    settings.write_subtitles = value;
  }

  if settings != before {
    store.save(&settings)?;
    println!("Settings saved");
  }
  print_settings(&settings);
  Ok(ExitCode::SUCCESS)
}

fn print_settings(settings: &Settings) {
  let cookies = match settings.cookie_payload.lines().filter(|l| !l.trim().is_empty()).count() {
    0 => "none".to_string(),
    n => format!("{n} line(s)"),
  };
  println!("cookies:         {cookies}");
  println!("auto clipboard:  {}", settings.auto_capture_clipboard);
  println!("default mode:    {}", settings.default_mode.label());
  println!("thumbnail:       {}", settings.write_thumbnail);
  println!("subtitles:       {}", settings.write_subtitles);
}

// --- Main ---

#[tokio::main]
async fn main() -> Result<ExitCode> {
  let cli = Cli::parse();
  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => config::default_data_dir().context("Could not determine a data directory, pass --data-dir")?,
  };
  let _log_guard = init_logging(&data_dir)?;
  log_panics();
  info!(version = env!("CARGO_PKG_VERSION"), data_dir = %data_dir.display(), "hustdl: starting");

  match cli.command {
    Command::Analyze { url } => analyze(&data_dir, url).await,
    Command::Download(download_args) => download(&data_dir, download_args).await,
    Command::History { clear } => history(&data_dir, clear),
    Command::Settings(settings_args) => settings(&data_dir, settings_args),
  }
}
