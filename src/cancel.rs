use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative stop signal shared between the dispatcher and one download worker.
///
/// Clear → Set only. Cloning shares the same flag; a new task gets a new token.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
  flag: Arc<AtomicBool>,
}

impl CancellationToken {
  pub fn new() -> Self {
    Self::default()
  }

  /// Request cancellation. Returns `true` only for the call that flipped the flag.
  pub fn cancel(&self) -> bool {
    !self.flag.swap(true, Ordering::AcqRel)
  }

  pub fn is_cancelled(&self) -> bool {
    self.flag.load(Ordering::Acquire)
  }
}
