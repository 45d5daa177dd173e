//! Corpus enumeration on disk.

use crate::AdapterError;
use anyhow::Context;
use covtrace_types::TestArtifact;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Extension of the sibling file marking an early-terminated artifact.
pub const EARLY_MARKER_EXTENSION: &str = "early";

/// `test000001.ktest` -> `test000001.early`; only the last extension is replaced.
pub fn early_marker_path(artifact: &Path) -> PathBuf {
    artifact.with_extension(EARLY_MARKER_EXTENSION)
}

/// Modification time in seconds since the UNIX epoch.
pub fn file_mtime(path: &Path) -> Result<f64, AdapterError> {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("failed to read mtime of {}", path.display()))?;
    let secs = match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    };
    Ok(secs)
}

/// mtime of an optional marker file; a missing file is `None`.
pub fn marker_mtime(path: &Path) -> Result<Option<f64>, AdapterError> {
    if !path.exists() {
        return Ok(None);
    }
    file_mtime(path).map(Some)
}

fn escaped_dir(dir: &Path) -> Result<String, AdapterError> {
    let s = dir
        .to_str()
        .ok_or_else(|| AdapterError::NonUtf8Path(dir.to_path_buf()))?;
    Ok(glob::Pattern::escape(s))
}

fn glob_files(pattern: &str) -> Result<Vec<PathBuf>, AdapterError> {
    let mut out = Vec::new();
    for entry in glob::glob(pattern).with_context(|| format!("invalid glob {pattern:?}"))? {
        let path = entry.context("failed to read corpus entry")?;
        if path.is_file() {
            out.push(path);
        }
    }
    Ok(out)
}

/// Artifacts in `dir` matching `pattern`, in enumeration (name) order.
///
/// With `skip_early`, artifacts whose early-termination marker exists are
/// left out.
pub fn list_artifacts(
    dir: &Path,
    pattern: &str,
    skip_early: bool,
) -> Result<Vec<TestArtifact>, AdapterError> {
    if !dir.is_dir() {
        return Err(AdapterError::CorpusNotFound(dir.to_path_buf()));
    }

    let full = format!("{}/{}", escaped_dir(dir)?, pattern);
    let mut out = Vec::new();
    for path in glob_files(&full)? {
        if skip_early && early_marker_path(&path).exists() {
            continue;
        }
        let mtime = file_mtime(&path)?;
        out.push(TestArtifact::new(path, mtime));
    }
    Ok(out)
}

/// Raw profiles written by replaying the artifact named `artifact_name`
/// (`<name>-<pid>.profraw`), sorted by path.
pub fn list_raw_profiles(
    profraw_dir: &Path,
    artifact_name: &str,
) -> Result<Vec<PathBuf>, AdapterError> {
    let full = format!(
        "{}/{}-*.profraw",
        escaped_dir(profraw_dir)?,
        glob::Pattern::escape(artifact_name)
    );
    let mut out = glob_files(&full)?;
    out.sort();
    Ok(out)
}
