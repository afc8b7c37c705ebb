use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::event::{Event, EventSender};
use crate::fetch::MediaFetcher;
use crate::worker::{self, Task, TaskKind};

#[derive(Debug, Error)]
pub enum DispatchError {
  #[error("another task is still running")]
  Busy,

  #[error("cannot write to {}: {source}", .path.display())]
  DirectoryUnwritable {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug)]
struct ActiveTask {
  kind: TaskKind,
  /// Only downloads are cancellable.
  cancel: Option<CancellationToken>,
}

/// Starts workers and holds the at-most-one-active-worker invariant.
///
/// The dispatcher never reads the channel itself: the consumer passes along
/// what it drained via [`Dispatcher::observe`], and `WorkerDone` makes it idle.
pub struct Dispatcher {
  fetcher: Arc<dyn MediaFetcher>,
  tx: EventSender,
  active: Option<ActiveTask>,
}

/// Create the directory if needed, then write and remove a zero-byte probe.
fn probe_writable(dir: &Path) -> Result<(), DispatchError> {
  let unwritable = |source| DispatchError::DirectoryUnwritable { path: dir.to_path_buf(), source };
  std::fs::create_dir_all(dir).map_err(unwritable)?;
  let probe = dir.join(format!(".hustdl-probe-{}", std::process::id()));
  std::fs::File::create(&probe).map_err(unwritable)?;
  std::fs::remove_file(&probe).map_err(unwritable)?;
  Ok(())
}

impl Dispatcher {
  pub fn new(fetcher: Arc<dyn MediaFetcher>, tx: EventSender) -> Self {
    Self { fetcher, tx, active: None }
  }

  /// Spawn a worker for `task` on the blocking pool and return immediately.
  /// Must be called from within a tokio runtime.
  pub fn start(&mut self, task: Task) -> Result<(), DispatchError> {
    if let Some(active) = &self.active {
      warn!(running = ?active.kind, requested = ?task.kind(), "dispatch: rejected, worker busy");
      return Err(DispatchError::Busy);
    }
    if let Task::Download(download) = &task {
      probe_writable(&download.destination)?;
    }

    let kind = task.kind();
    info!(kind = ?kind, url = %task.url(), "dispatch: starting worker");
    let fetcher = Arc::clone(&self.fetcher);
    let tx = self.tx.clone();
    let cancel = match task {
      Task::Analyze(analyze) => {
        tokio::task::spawn_blocking(move || {
          worker::run_guarded(&tx, || worker::run_analyze(fetcher.as_ref(), &analyze, &tx))
        });
        None
      }
      Task::Download(download) => {
        let token = CancellationToken::new();
        let worker_token = token.clone();
        tokio::task::spawn_blocking(move || {
          worker::run_guarded(&tx, || worker::run_download(fetcher.as_ref(), &download, &worker_token, &tx))
        });
        Some(token)
      }
    };
    self.active = Some(ActiveTask { kind, cancel });
    Ok(())
  }

  /// Ask the running download to stop. Returns false when there is nothing to
  /// cancel or cancellation was already requested.
  pub fn request_cancel(&self) -> bool {
    let requested = self.active.as_ref().and_then(|a| a.cancel.as_ref()).is_some_and(CancellationToken::cancel);
    if requested {
      info!("dispatch: cancellation requested");
    }
    requested
  }

  pub fn observe(&mut self, event: &Event) {
    if *event == Event::WorkerDone
      && let Some(done) = self.active.take()
    {
      debug!(kind = ?done.kind, "dispatch: worker done, idle");
    }
  }

  pub fn is_busy(&self) -> bool {
    self.active.is_some()
  }

  pub fn active_kind(&self) -> Option<TaskKind> {
    self.active.as_ref().map(|a| a.kind)
  }
}
