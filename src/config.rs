use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::constants::constants;
use crate::event::MediaKind;

const SETTINGS_FILE: &str = "settings.toml";

/// Persisted user preferences. Missing fields fall back to their defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
  /// Netscape-format cookie jar contents passed to the fetcher, empty for none.
  pub cookie_payload: String,
  pub auto_capture_clipboard: bool,
  pub default_mode: MediaKind,
  pub write_thumbnail: bool,
  pub write_subtitles: bool,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      cookie_payload: String::new(),
      auto_capture_clipboard: false,
      default_mode: MediaKind::Video,
      write_thumbnail: false,
      write_subtitles: false,
    }
  }
}

/// Platform data directory for settings, history and logs.
pub fn default_data_dir() -> Option<PathBuf> {
  ProjectDirs::from("", "", &constants().app_name).map(|dirs| dirs.data_dir().to_path_buf())
}

fn write_file(path: &Path, contents: &str, private: bool) -> std::io::Result<()> {
  let mut options = std::fs::OpenOptions::new();
  options.write(true).create(true).truncate(true);
  #[cfg(unix)]
  if private {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(0o600);
  }
  let mut file = options.open(path)?;
  // `mode` only applies to newly created files.
  #[cfg(unix)]
  if private {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
  }
  file.write_all(contents.as_bytes())
}

/// Write `contents` next to `path` and rename it into place. `private` files
/// are readable by the owner only (unix).
pub(crate) fn write_atomic(path: &Path, contents: &str, private: bool) -> Result<()> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
  }
  let tmp_path = path.with_extension("toml.part");
  write_file(&tmp_path, contents, private).with_context(|| format!("Failed to write {}", tmp_path.display()))?;
  std::fs::rename(&tmp_path, path).with_context(|| format!("Failed to finalize {}", path.display()))?;
  Ok(())
}

/// Single-record settings persistence.
#[derive(Debug, Clone)]
pub struct SettingsStore {
  path: PathBuf,
}

impl SettingsStore {
  pub fn new(dir: &Path) -> Self {
    Self { path: dir.join(SETTINGS_FILE) }
  }

  /// Absent or malformed data yields the defaults.
  pub fn load(&self) -> Settings {
    let content = match std::fs::read_to_string(&self.path) {
      Ok(content) => content,
      Err(e) => {
        debug!(path = %self.path.display(), err = %e, "store: no settings, using defaults");
        return Settings::default();
      }
    };
    match toml::from_str(&content) {
      Ok(settings) => settings,
      Err(e) => {
        warn!(path = %self.path.display(), err = %e, "store: malformed settings, using defaults");
        Settings::default()
      }
    }
  }

  pub fn save(&self, settings: &Settings) -> Result<()> {
    let content = toml::to_string(settings).context("Failed to serialize settings")?;
    // The cookie jar is a credential.
    let private = !settings.cookie_payload.trim().is_empty();
    write_atomic(&self.path, &content, private)?;
    debug!(path = %self.path.display(), private, "store: settings saved");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(SettingsStore::new(dir.path()).load(), Settings::default());
  }

  #[test]
  fn malformed_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(SETTINGS_FILE), "cookie_payload = [not toml").unwrap();
    assert_eq!(SettingsStore::new(dir.path()).load(), Settings::default());
  }

  #[test]
  fn wrong_types_yield_defaults() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(SETTINGS_FILE), "auto_capture_clipboard = \"yes\"\n").unwrap();
    assert_eq!(SettingsStore::new(dir.path()).load(), Settings::default());
  }

  #[test]
  fn partial_file_fills_missing_fields() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(SETTINGS_FILE), "default_mode = \"audio\"\n").unwrap();
    let settings = SettingsStore::new(dir.path()).load();
    assert_eq!(settings.default_mode, MediaKind::Audio);
    assert!(!settings.auto_capture_clipboard);
    assert!(settings.cookie_payload.is_empty());
  }

  #[test]
  fn save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = SettingsStore::new(&dir.path().join("nested"));
    let settings = Settings {
      cookie_payload: "# Netscape HTTP Cookie File\n".to_string(),
      auto_capture_clipboard: true,
      default_mode: MediaKind::Audio,
      write_thumbnail: true,
      write_subtitles: false,
    };
    store.save(&settings).unwrap();
    assert_eq!(store.load(), settings);
  }

  #[cfg(unix)]
  #[test]
  fn cookies_make_the_file_owner_only() {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir().unwrap();
    let store = SettingsStore::new(dir.path());
    let mode = || std::fs::metadata(dir.path().join(SETTINGS_FILE)).unwrap().permissions().mode() & 0o777;

    let jar = ".youtube.com\tTRUE\t/\tTRUE\t0\tSID\tsecret\n".to_string();
    store.save(&Settings { cookie_payload: jar, ..Settings::default() }).unwrap();
    assert_eq!(mode(), 0o600);

    // A leftover world-readable temp file must not leak its mode.
    std::fs::write(dir.path().join("settings.toml.part"), "").unwrap();
    std::fs::set_permissions(dir.path().join("settings.toml.part"), std::fs::Permissions::from_mode(0o644)).unwrap();
    store.save(&Settings { auto_capture_clipboard: true, ..store.load() }).unwrap();
    assert_eq!(mode(), 0o600);
  }
}
