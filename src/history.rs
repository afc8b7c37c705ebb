use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::write_atomic;
use crate::constants::constants;
use crate::event::MediaKind;

const HISTORY_FILE: &str = "history.toml";

/// One completed download.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoryEntry {
  pub title: String,
  pub timestamp: DateTime<Local>,
  pub final_path: PathBuf,
  pub media_kind: MediaKind,
}

#[derive(Serialize, Deserialize, Default)]
struct HistoryFile {
  #[serde(default)]
  entries: Vec<HistoryEntry>,
}

/// Newest-first list of completed downloads, capped and persisted on every insert.
pub struct HistoryStore {
  path: PathBuf,
  limit: usize,
  entries: Vec<HistoryEntry>,
}

impl HistoryStore {
  pub fn open(dir: &Path) -> Self {
    Self::with_limit(dir, constants().history_limit)
  }

  pub fn with_limit(dir: &Path, limit: usize) -> Self {
    let path = dir.join(HISTORY_FILE);
    let mut entries = match std::fs::read_to_string(&path) {
      Ok(content) => match toml::from_str::<HistoryFile>(&content) {
        Ok(file) => file.entries,
        Err(e) => {
          warn!(path = %path.display(), err = %e, "store: malformed history, starting empty");
          Vec::new()
        }
      },
      Err(_) => Vec::new(),
    };
    entries.truncate(limit);
    Self { path, limit, entries }
  }

  pub fn entries(&self) -> &[HistoryEntry] {
    &self.entries
  }

  /// Prepend `entry`, evict past the cap, and write through.
  pub fn record_completion(&mut self, entry: HistoryEntry) -> Result<()> {
    self.entries.insert(0, entry);
    self.entries.truncate(self.limit);
    self.persist()
  }

  pub fn clear(&mut self) -> Result<()> {
    self.entries.clear();
    self.persist()
  }

  fn persist(&self) -> Result<()> {
    let file = HistoryFile { entries: self.entries.clone() };
    let content = toml::to_string(&file).context("Failed to serialize history")?;
    write_atomic(&self.path, &content, false)?;
    debug!(path = %self.path.display(), count = self.entries.len(), "store: history saved");
    Ok(())
  }
}
