//! Recovery dump: append-only record of DTRs entering and leaving the transfer phase.
//!
//! One line per transition: `<dtr id> <phase> <locator> <job id>`. On start
//! the scheduler replays the file; a DTR whose last recorded phase is
//! `TRANSFERRING` was interrupted and its destination may hold partial data.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::dtr::{Dtr, DtrStatus};

pub struct RecoveryLog {
    path: PathBuf,
    file: fs::File,
}

impl RecoveryLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dump dir: {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open dump file: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a transition record and flush it to disk.
    pub fn record(&mut self, dtr: &Dtr, phase: DtrStatus) -> Result<()> {
        let dest = dtr.destination().to_string();
        self.write_line(&dtr.id.to_string(), phase, &dest, dtr.job_id.as_str())
    }

    /// Close the record of a transfer interrupted by an earlier run.
    pub fn close(&mut self, entry: &Interrupted, phase: DtrStatus) -> Result<()> {
        self.write_line(&entry.id, phase, &entry.locator, &entry.job_id)
    }

    /// Replace the dump by the given interrupted transfers only.
    pub fn rewrite(&mut self, carried: &[Interrupted]) -> Result<()> {
        self.file
            .set_len(0)
            .with_context(|| format!("truncate dump file: {}", self.path.display()))?;
        for entry in carried {
            self.write_line(&entry.id, DtrStatus::Transferring, &entry.locator, &entry.job_id)?;
        }
        self.file.sync_data()?;
        Ok(())
    }

    /// Clean shutdown: nothing is in transfer any more.
    pub fn truncate(&mut self) -> Result<()> {
        self.rewrite(&[])
    }

    fn write_line(&mut self, id: &str, phase: DtrStatus, locator: &str, job_id: &str) -> Result<()> {
        writeln!(self.file, "{} {} {} {}", id, phase, locator, job_id)
            .with_context(|| format!("write dump file: {}", self.path.display()))?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// A transfer whose last recorded phase is `TRANSFERRING`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interrupted {
    pub id: String,
    pub locator: String,
    pub job_id: String,
}

struct DumpLine<'a> {
    id: &'a str,
    phase: DtrStatus,
    locator: &'a str,
    job_id: &'a str,
}

fn parse_dump_line(line: &str) -> Option<DumpLine<'_>> {
    let (id, rest) = line.trim_end().split_once(' ')?;
    let (phase, rest) = rest.split_once(' ')?;
    // The job id never contains spaces; the locator may.
    let (locator, job_id) = rest.rsplit_once(' ')?;
    let phase = phase.parse().ok()?;
    if locator.is_empty() {
        return None;
    }
    Some(DumpLine {
        id,
        phase,
        locator,
        job_id,
    })
}

/// Destinations of DTRs whose last recorded phase is a transfer. Missing file: none.
pub fn read_interrupted(path: &Path) -> Result<Vec<String>> {
    Ok(read_interrupted_records(path)?
        .into_iter()
        .map(|e| e.locator)
        .collect())
}

/// Like [`read_interrupted`], keeping the record ids and job ids.
pub fn read_interrupted_records(path: &Path) -> Result<Vec<Interrupted>> {
    let data = match fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("read dump file: {}", path.display()));
        }
    };

    let mut order: Vec<&str> = Vec::new();
    let mut last: HashMap<&str, DumpLine<'_>> = HashMap::new();
    for (n, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let Some(entry) = parse_dump_line(line) else {
            tracing::warn!(line = n + 1, "skipping malformed dump line: {}", line);
            continue;
        };
        let id = entry.id;
        if last.insert(id, entry).is_none() {
            order.push(id);
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|id| match last.get(id) {
            Some(e) if e.phase == DtrStatus::Transferring => Some(Interrupted {
                id: e.id.to_string(),
                locator: e.locator.to_string(),
                job_id: e.job_id.to_string(),
            }),
            _ => None,
        })
        .collect())
}
