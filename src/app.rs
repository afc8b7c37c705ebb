use chrono::Local;
use std::future::Future;
use std::path::PathBuf;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::constants::constants;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::event::{Event, EventReceiver, FormatOption, MediaKind};
use crate::history::{HistoryEntry, HistoryStore};
use crate::worker::{Task, TaskKind};

// --- View state ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
  #[default]
  Idle,
  Analyzing,
  Downloading,
  /// Cancellation requested, waiting for the worker to notice.
  Cancelling,
}

/// How the last task ended. Exactly one per task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  Analyzed,
  Finished { title: String, final_path: PathBuf, media_kind: MediaKind },
  Cancelled,
  Failed(String),
}

impl Outcome {
  pub fn banner(&self) -> String {
    match self {
      Outcome::Analyzed => "Analysis complete".to_string(),
      Outcome::Finished { title, final_path, media_kind } => {
        format!("Saved {} \"{}\" to {}", media_kind.label(), title, final_path.display())
      }
      Outcome::Cancelled => "Download cancelled".to_string(),
      Outcome::Failed(message) => format!("Error: {message}"),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
  pub title: String,
  pub is_playlist: bool,
  pub format_options: Vec<FormatOption>,
}

/// Everything the UI shows. Only the consumer mutates it.
#[derive(Debug, Default)]
pub struct View {
  pub phase: Phase,
  /// Fraction in `0.0..=1.0`.
  pub progress: f64,
  pub speed_label: String,
  pub eta_label: String,
  /// Running log of non-terminal notable events.
  pub log: Vec<String>,
  pub outcome: Option<Outcome>,
  pub analysis: Option<Analysis>,
  /// Bumped once per applied batch.
  pub revision: u64,
}

// --- Consumer ---

/// Single consumer of the event channel. Owns the dispatcher and the history
/// store so that terminal events can flip the one and write the other.
pub struct Consumer {
  rx: EventReceiver,
  dispatcher: Dispatcher,
  history: HistoryStore,
  view: View,
}

impl Consumer {
  pub fn new(rx: EventReceiver, dispatcher: Dispatcher, history: HistoryStore) -> Self {
    Self { rx, dispatcher, history, view: View::default() }
  }

  pub fn view(&self) -> &View {
    &self.view
  }

  pub fn is_idle(&self) -> bool {
    !self.dispatcher.is_busy()
  }

  pub fn start(&mut self, task: Task) -> Result<(), DispatchError> {
    let kind = task.kind();
    self.dispatcher.start(task)?;
    let view = &mut self.view;
    view.phase = match kind {
      TaskKind::Analyze => Phase::Analyzing,
      TaskKind::Download => Phase::Downloading,
    };
    view.progress = 0.0;
    view.speed_label.clear();
    view.eta_label.clear();
    view.outcome = None;
    view.revision += 1;
    Ok(())
  }

  pub fn request_cancel(&mut self) -> bool {
    if !self.dispatcher.request_cancel() {
      return false;
    }
    self.view.phase = Phase::Cancelling;
    self.view.log.push("Cancelling...".to_string());
    self.view.revision += 1;
    true
  }

  /// Drain everything pending and apply it as one batch. Returns whether the view changed.
  pub fn tick(&mut self) -> bool {
    if self.rx.is_empty() {
      return false;
    }
    if self.rx.len() == self.rx.capacity() {
      warn!(capacity = self.rx.capacity(), "consumer: event channel full, oldest events dropped");
    }
    let batch = self.rx.drain();
    debug!(events = batch.len(), "consumer: applying batch");
    for event in batch {
      self.dispatcher.observe(&event);
      self.apply(event);
    }
    self.view.revision += 1;
    true
  }

  fn apply(&mut self, event: Event) {
    let view = &mut self.view;
    match event {
      Event::AnalyzeDone { title, is_playlist, format_options } => {
        match format_options.iter().filter_map(|o| o.height).max() {
          Some(best) => view.log.push(format!("Found \"{title}\", up to {best}p")),
          None => view.log.push(format!("Found \"{title}\", audio only")),
        }
        view.analysis = Some(Analysis { title, is_playlist, format_options });
        view.outcome = Some(Outcome::Analyzed);
      }
      Event::Progress { percent, speed_label, eta_label } => {
        view.progress = percent;
        view.speed_label = speed_label;
        view.eta_label = eta_label;
      }
      Event::Finished { title, final_path, media_kind } => {
        view.progress = 1.0;
        let entry =
          HistoryEntry { title: title.clone(), timestamp: Local::now(), final_path: final_path.clone(), media_kind };
        if let Err(e) = self.history.record_completion(entry) {
          warn!(err = %format!("{:#}", e), "consumer: failed to record history");
          view.log.push(format!("Could not save history: {e:#}"));
        }
        info!(title = %title, path = %final_path.display(), "consumer: download finished");
        view.outcome = Some(Outcome::Finished { title, final_path, media_kind });
      }
      Event::Cancelled => view.outcome = Some(Outcome::Cancelled),
      Event::Error { message } => view.outcome = Some(Outcome::Failed(message)),
      Event::Log { message } => view.log.push(message),
      Event::WorkerDone => view.phase = Phase::Idle,
    }
  }

  /// Stop following the running task. The worker still runs to its end; the
  /// view reports the task as stopped.
  pub fn abandon(&mut self) {
    let kind = self.dispatcher.active_kind();
    warn!(kind = ?kind, "consumer: interrupted again, no longer waiting for the worker");
    let view = &mut self.view;
    if view.outcome.is_none() {
      view.outcome = Some(match kind {
        Some(TaskKind::Analyze) => Outcome::Failed("Interrupted before the analysis finished".to_string()),
        _ => Outcome::Cancelled,
      });
    }
    view.phase = Phase::Idle;
    view.revision += 1;
  }

  /// Poll on a fixed tick until the worker is done, rendering after each
  /// change. `interrupt` makes the future for the next interrupt: the first
  /// one requests cancellation, the second returns without waiting for the
  /// worker. Returns false in that case.
  pub async fn run<F>(&mut self, mut interrupt: impl FnMut() -> F, mut render: impl FnMut(&View)) -> bool
  where
    F: Future<Output = ()>,
  {
    let next_interrupt = interrupt();
    tokio::pin!(next_interrupt);
    let mut interrupted = false;
    let mut ticker = tokio::time::interval(constants().consumer_tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          if self.tick() {
            render(&self.view);
          }
          if self.is_idle() {
            return true;
          }
        }
        () = &mut next_interrupt => {
          if interrupted {
            self.abandon();
            render(&self.view);
            return false;
          }
          interrupted = true;
          if self.request_cancel() {
            render(&self.view);
          } else {
            info!(kind = ?self.dispatcher.active_kind(), "consumer: nothing cancellable is running");
          }
          next_interrupt.set(interrupt());
        }
      }
    }
  }
}
