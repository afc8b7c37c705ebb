//! Filesystem-safe names for produced artifacts.
//!
//! `sanitize` is pure and idempotent. `rename_produced` applies it to a file the
//! fetcher already wrote and never fails: any problem keeps the original path.

use anyhow::{Context, Result, bail};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::constants::constants;

fn is_kept(c: char) -> bool {
  c.is_alphanumeric() || c == '_' || c == '.' || c == '-' || c.is_whitespace()
}

/// NFKD, drop combining marks and disallowed chars, collapse and trim whitespace.
fn clean(name: &str) -> String {
  let mut out = String::with_capacity(name.len());
  let mut pending_space = false;
  for c in name.nfkd().filter(|c| !is_combining_mark(*c) && is_kept(*c)) {
    if c.is_whitespace() {
      pending_space = !out.is_empty();
      continue;
    }
    if pending_space {
      out.push(' ');
      pending_space = false;
    }
    out.push(c);
  }
  out
}

/// Split `name` into `(stem, ".ext")`. The extension must be alphanumeric and
/// directly follow a non-space character; otherwise the whole name is the stem.
fn split_extension(name: &str) -> (&str, &str) {
  if let Some(dot) = name.rfind('.') {
    let ext = &name[dot + 1..];
    let before = name[..dot].chars().next_back();
    if !ext.is_empty() && ext.chars().all(char::is_alphanumeric) && before.is_some_and(|c| !c.is_whitespace()) {
      return (&name[..dot], &name[dot..]);
    }
  }
  (name, "")
}

/// First `n` chars of `s`.
fn truncate_chars(s: &str, n: usize) -> &str {
  s.char_indices().nth(n).map_or(s, |(i, _)| &s[..i])
}

/// Make `name` safe for constrained filesystems, at most `max_len` chars long.
///
/// The extension survives truncation unless it alone would not fit.
pub fn sanitize(name: &str, max_len: usize) -> String {
  let cleaned = clean(name);
  let (stem, ext) = match split_extension(&cleaned) {
    (stem, ext) if ext.chars().count() < max_len => (stem, ext),
    _ => (cleaned.as_str(), ""),
  };
  let budget = max_len - ext.chars().count();
  let stem = truncate_chars(stem, budget).trim_end();
  format!("{stem}{ext}")
}

/// Heuristic for a site-assigned id suffix such as `dQw4w9WgXcQ`.
fn looks_like_id(segment: &str) -> bool {
  !segment.is_empty()
    && segment.chars().count() <= constants().max_id_len
    && segment.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Sanitize a `title-id` stem, keeping the id verbatim when it looks like one.
pub fn sanitized_stem(stem: &str, max_title_len: usize) -> String {
  if let Some((title, id)) = stem.rsplit_once('-')
    && looks_like_id(id)
  {
    let title = sanitize(title, max_title_len);
    if title.is_empty() {
      return id.to_string();
    }
    return format!("{title}-{id}");
  }
  sanitize(stem, max_title_len)
}

fn candidate_path(dir: &Path, stem: &str, ext: Option<&str>, counter: u32) -> PathBuf {
  let mut name = stem.to_string();
  if counter > 0 {
    name.push_str(&format!("_{counter}"));
  }
  if let Some(ext) = ext {
    name.push('.');
    name.push_str(ext);
  }
  dir.join(name)
}

fn try_rename(path: &Path, max_title_len: usize) -> Result<PathBuf> {
  let meta = std::fs::metadata(path).with_context(|| format!("cannot stat {}", path.display()))?;
  if !meta.is_file() {
    bail!("{} is not a regular file", path.display());
  }
  let stem = path.file_stem().and_then(OsStr::to_str).context("file name is not valid UTF-8")?;
  let ext = path.extension().and_then(OsStr::to_str);
  let new_stem = sanitized_stem(stem, max_title_len);
  if new_stem.is_empty() {
    bail!("sanitized name of {} is empty", path.display());
  }

  let dir = path.parent().unwrap_or(Path::new("."));
  let mut counter = 0;
  let mut target = candidate_path(dir, &new_stem, ext, counter);
  while target != path && target.exists() {
    counter += 1;
    target = candidate_path(dir, &new_stem, ext, counter);
  }

  if target != path {
    std::fs::rename(path, &target)
      .with_context(|| format!("failed to rename {} to {}", path.display(), target.display()))?;
    debug!(from = %path.display(), to = %target.display(), "rename: produced file renamed");
  }
  Ok(target)
}

/// Rename a produced artifact to its sanitized, collision-free name.
///
/// Best-effort: returns `path` unchanged on any failure.
pub fn rename_produced(path: &Path, max_title_len: usize) -> PathBuf {
  match try_rename(path, max_title_len) {
    Ok(renamed) => renamed,
    Err(e) => {
      warn!(path = %path.display(), err = %format!("{:#}", e), "rename: keeping original name");
      path.to_path_buf()
    }
  }
}
