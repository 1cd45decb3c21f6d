//! Session directory cleanup before and after staging.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Absolute path of a session-relative `pfn`.
pub fn session_path(session_dir: &Path, pfn: &str) -> PathBuf {
    session_dir.join(pfn.trim_start_matches('/'))
}

fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Remove the listed files (and directories) from the session directory.
pub fn remove_listed<'a, I>(session_dir: &Path, pfns: I) -> Result<usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut removed = 0;
    for pfn in pfns {
        let path = session_path(session_dir, pfn);
        if fs::symlink_metadata(&path).is_err() {
            continue;
        }
        remove_path(&path).with_context(|| format!("remove {}", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}

/// Remove everything under the session directory except the listed paths
/// (a listed directory keeps its whole content). Directories left empty are
/// removed too; the session directory itself is kept.
pub fn remove_unlisted<'a, I>(session_dir: &Path, keep: I) -> Result<usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let keep: HashSet<PathBuf> = keep
        .into_iter()
        .map(|pfn| session_path(session_dir, pfn))
        .collect();
    let is_kept = |p: &Path| keep.iter().any(|k| p.starts_with(k));
    let is_ancestor_of_kept = |p: &Path| keep.iter().any(|k| k.starts_with(p));

    let mut removed = 0;
    let mut dirs = Vec::new();
    let walker = WalkDir::new(session_dir).min_depth(1).follow_links(false);
    let mut it = walker.into_iter();
    while let Some(entry) = it.next() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("scan {}", session_dir.display()));
            }
        };
        let path = entry.path();
        if is_kept(path) {
            if entry.file_type().is_dir() {
                it.skip_current_dir();
            }
            continue;
        }
        if entry.file_type().is_dir() {
            if !is_ancestor_of_kept(path) {
                remove_path(path).with_context(|| format!("remove {}", path.display()))?;
                removed += 1;
                it.skip_current_dir();
            } else {
                dirs.push(path.to_path_buf());
            }
            continue;
        }
        remove_path(path).with_context(|| format!("remove {}", path.display()))?;
        removed += 1;
    }

    // Deepest first, so parents see their children gone.
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        let empty = fs::read_dir(&dir)
            .map(|mut rd| rd.next().is_none())
            .unwrap_or(false);
        if empty {
            fs::remove_dir(&dir).with_context(|| format!("remove {}", dir.display()))?;
        }
    }
    Ok(removed)
}
