//! Per-job transfer statistics (`job.<id>.statistics`), one line per completed DTR.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::dtr::{CacheState, Dtr};

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `inputfile:url=..,size=..,starttime=..,endtime=..,fromcache=yes|no`
pub(crate) fn input_line(dtr: &Dtr, size: Option<u64>) -> String {
    let mut line = format!("inputfile:url={},", dtr.source());
    if let Some(size) = size {
        line.push_str(&format!("size={},", size));
    }
    line.push_str(&format!(
        "starttime={},endtime={},fromcache={}",
        timestamp(dtr.created_at),
        timestamp(dtr.finished_at.unwrap_or_else(Utc::now)),
        if dtr.cache_state == CacheState::AlreadyPresent {
            "yes"
        } else {
            "no"
        }
    ));
    line
}

/// `outputfile:url=..,size=..,starttime=..,endtime=..`
pub(crate) fn output_line(dtr: &Dtr) -> String {
    let mut line = format!("outputfile:url={},", dtr.destination());
    if let Some(size) = dtr.source_size {
        line.push_str(&format!("size={},", size));
    }
    line.push_str(&format!(
        "starttime={},endtime={}",
        timestamp(dtr.created_at),
        timestamp(dtr.finished_at.unwrap_or_else(Utc::now))
    ));
    line
}

/// Create the statistics file if it does not exist yet.
pub(crate) fn touch(path: &Path) -> Result<()> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("create statistics file: {}", path.display()))?;
    Ok(())
}

pub(crate) fn append(path: &Path, line: &str) -> Result<()> {
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open statistics file: {}", path.display()))?;
    writeln!(f, "{}", line)?;
    Ok(())
}
