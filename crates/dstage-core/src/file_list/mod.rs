//! Per-job file lists: the declared inputs and outputs of a job.
//!
//! Each list is line oriented: `pfn [lfn [cred]]`, fields separated by single
//! spaces, `\` escaping spaces and backslashes inside a field. `pfn` is the
//! path relative to the session directory and always starts with `/`. A `pfn`
//! of the form `/@name` is a dynamic list: the session file `name` is itself a
//! file list written by the job at runtime.

mod store;

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

pub use store::{ControlDir, JobFileStore, JobLocal};

/// One declared file of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the session directory, starting with `/`.
    pub pfn: String,
    /// Remote locator, or size/checksum info for user-handled files, or empty.
    pub lfn: String,
    /// Credential file for this transfer only.
    pub cred: Option<String>,
}

impl FileEntry {
    pub fn new(pfn: impl Into<String>, lfn: impl Into<String>) -> Self {
        let mut pfn = pfn.into();
        if !pfn.starts_with('/') {
            pfn.insert(0, '/');
        }
        Self {
            pfn,
            lfn: lfn.into(),
            cred: None,
        }
    }

    pub fn with_cred(mut self, cred: impl Into<String>) -> Self {
        self.cred = Some(cred.into());
        self
    }

    /// Entries naming a remote locator are staged by DTRs; the rest are moved by the user.
    pub fn is_remote(&self) -> bool {
        self.lfn.contains(':')
    }

    /// Name of the session file holding a dynamic list, for `/@name` entries.
    pub fn dynamic_list(&self) -> Option<&str> {
        self.pfn.strip_prefix("/@").filter(|n| !n.is_empty())
    }

    /// The entry for the list file itself once its content has been expanded.
    pub fn list_file_entry(&self) -> Option<FileEntry> {
        self.dynamic_list().map(|name| FileEntry {
            pfn: format!("/{}", name),
            lfn: self.lfn.clone(),
            cred: self.cred.clone(),
        })
    }
}

/// Parse one list line. Returns `Ok(None)` for blank and comment lines.
pub fn parse_line(line: &str) -> Result<Option<FileEntry>> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() || trimmed.trim_start().starts_with('#') {
        return Ok(None);
    }
    let mut fields = split_escaped(trimmed).into_iter();
    let pfn = fields.next().unwrap_or_default();
    let lfn = fields.next().unwrap_or_default();
    let cred = fields.next().filter(|c| !c.is_empty());
    let entry = FileEntry {
        cred,
        ..FileEntry::new(pfn, lfn)
    };
    if entry.pfn.split('/').any(|c| c == "..") {
        anyhow::bail!("file path escapes the session directory: {}", entry.pfn);
    }
    Ok(Some(entry))
}

/// Format one entry as a list line (without newline).
pub fn format_line(entry: &FileEntry) -> String {
    let mut line = escape(&entry.pfn);
    if !entry.lfn.is_empty() || entry.cred.is_some() {
        line.push(' ');
        line.push_str(&escape(&entry.lfn));
    }
    if let Some(cred) = &entry.cred {
        line.push(' ');
        line.push_str(&escape(cred));
    }
    line
}

fn split_escaped(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ' ' => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}

fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        if c == ' ' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Read a whole list file.
pub fn read_list(path: &Path) -> Result<Vec<FileEntry>> {
    let data =
        fs::read_to_string(path).with_context(|| format!("read file list: {}", path.display()))?;
    let mut entries = Vec::new();
    for (n, line) in data.lines().enumerate() {
        let entry = parse_line(line)
            .with_context(|| format!("{}:{}: invalid entry", path.display(), n + 1))?;
        entries.extend(entry);
    }
    Ok(entries)
}

/// Replace a list file atomically (write to a unique sibling temp file, then rename).
pub fn write_list(path: &Path, entries: &[FileEntry]) -> Result<()> {
    let mut body = String::new();
    for entry in entries {
        body.push_str(&format_line(entry));
        body.push('\n');
    }
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("create file list: {}", path.display()))?;
    tmp.write_all(body.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("replace file list: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests;
