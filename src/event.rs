//! Typed worker → consumer events and the bounded channel that carries them.
//!
//! The channel never blocks the producer: pushing into a full channel evicts
//! the oldest queued event first. Progress delivery must never stall a fetch.

use clap::ValueEnum;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What a finished download produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
  Video,
  Audio,
}

impl MediaKind {
  pub fn label(self) -> &'static str {
    match self {
      MediaKind::Video => "video",
      MediaKind::Audio => "audio",
    }
  }
}

/// A selectable quality offered by an analyze task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOption {
  pub id: String,
  pub label: String,
  pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
  AnalyzeDone { title: String, is_playlist: bool, format_options: Vec<FormatOption> },
  /// `percent` is a fraction in `0.0..=1.0`.
  Progress { percent: f64, speed_label: String, eta_label: String },
  Finished { title: String, final_path: PathBuf, media_kind: MediaKind },
  Cancelled,
  Error { message: String },
  Log { message: String },
  /// Always the last event of a task.
  WorkerDone,
}

impl Event {
  pub fn log(message: impl Into<String>) -> Self {
    Event::Log { message: message.into() }
  }

  pub fn error(message: impl Into<String>) -> Self {
    Event::Error { message: message.into() }
  }

  /// Whether this event is a task's outcome. Analyze tasks end with `AnalyzeDone` or `Error`,
  /// downloads with `Finished`, `Cancelled` or `Error`.
  pub fn is_terminal(&self) -> bool {
    matches!(self, Event::AnalyzeDone { .. } | Event::Finished { .. } | Event::Cancelled | Event::Error { .. })
  }
}

/// Create a bounded event channel holding at most `capacity` events.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
  // A zero-capacity crossbeam channel is a rendezvous channel; keep at least one slot.
  let capacity = capacity.max(1);
  let (tx, rx) = crossbeam_channel::bounded(capacity);
  (EventSender { tx, evict: rx.clone() }, EventReceiver { rx, capacity })
}

/// Producer half. Cheap to clone; handed to each worker at spawn time.
#[derive(Debug, Clone)]
pub struct EventSender {
  tx: Sender<Event>,
  /// Producer-side handle on the queue head, used only to drop the oldest event.
  evict: Receiver<Event>,
}

impl EventSender {
  /// Enqueue `event` without blocking. Returns how many queued events were evicted.
  pub fn push(&self, event: Event) -> usize {
    let mut event = event;
    let mut evicted = 0;
    loop {
      match self.tx.try_send(event) {
        Ok(()) => return evicted,
        Err(TrySendError::Full(rejected)) => {
          if self.evict.try_recv().is_ok() {
            evicted += 1;
          }
          event = rejected;
        }
        // The sender holds a receiver itself, so this only happens if crossbeam changes semantics.
        Err(TrySendError::Disconnected(_)) => return evicted,
      }
    }
  }
}

/// Consumer half, drained on the consumer's own schedule.
#[derive(Debug)]
pub struct EventReceiver {
  rx: Receiver<Event>,
  capacity: usize,
}

impl EventReceiver {
  /// Take every event queued at the time of the call, oldest first.
  pub fn drain(&self) -> Vec<Event> {
    let pending = self.rx.len();
    (0..pending).map_while(|_| self.rx.try_recv().ok()).collect()
  }

  pub fn len(&self) -> usize {
    self.rx.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rx.is_empty()
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }
}
