//! Folding finished DTRs back into their jobs.

use std::fs;
use std::path::Path;

use super::{stats, Inner};
use crate::dtr::{Direction, Dtr, DtrStatus};
use crate::file_list::FileEntry;
use crate::job::JobId;
use crate::session::{self, session_path};
use crate::url_model::Locator;

fn canonical(locator: &str) -> String {
    Locator::parse(locator)
        .map(|l| l.canonical())
        .unwrap_or_else(|_| locator.to_string())
}

impl Inner {
    pub(super) fn reconcile(&self, dtr: Dtr) {
        let job_id = dtr.job_id.clone();
        let direction = dtr.direction();

        if dtr.is_invalid_request() || !dtr.is_valid() {
            if dtr.is_cancelled() {
                return;
            }
            tracing::error!(dtr_id = %dtr.id, job_id = %job_id, "invalid DTR: {}", dtr.error_text());
            self.scheduler.cancel(&job_id);
            {
                let mut st = self.state();
                st.finished
                    .insert(job_id.clone(), "Invalid Data Transfer Request".into());
                st.active.remove(&job_id);
                st.sessions.remove(&job_id);
            }
            self.wake(&job_id);
            return;
        }

        let session_dir = self.session_dir(&job_id);
        let mut stats_line = None;
        match dtr.status {
            DtrStatus::FailedPermanent | DtrStatus::FailedTemporary => {
                let desc = dtr.error_text();
                tracing::error!(dtr_id = %dtr.id, job_id = %job_id, "DTR failed: {}", desc);
                let mut st = self.state();
                if direction == Direction::Download && !st.finished.contains_key(&job_id) {
                    self.scheduler.cancel(&job_id);
                }
                st.finished
                    .entry(job_id.clone())
                    .or_default()
                    .push_str(&format!("Failed in data staging: {}\n", desc));
            }
            DtrStatus::Cancelled => {
                tracing::info!(dtr_id = %dtr.id, job_id = %job_id, "DTR cancelled");
            }
            _ => {
                stats_line = match direction {
                    Direction::Upload => {
                        self.record_upload(&dtr, session_dir.as_deref());
                        Some(stats::output_line(&dtr))
                    }
                    Direction::Download => {
                        let size = self.record_download(&dtr, session_dir.as_deref());
                        Some(stats::input_line(&dtr, size))
                    }
                };
            }
        }

        let last = {
            let mut st = self.state();
            let Some(outstanding) = st.active.get_mut(&job_id) else {
                tracing::warn!(dtr_id = %dtr.id, job_id = %job_id, "no active job for DTR");
                return;
            };
            outstanding.remove(&dtr.id);
            outstanding.is_empty()
        };
        if let Some(line) = stats_line {
            if let Err(e) = stats::append(&self.store.statistics_path(&job_id), &line) {
                tracing::warn!(job_id = %job_id, "{:#}", e);
            }
        }
        if last {
            self.finalize(&dtr, direction, session_dir.as_deref());
        }
    }

    fn session_dir(&self, job_id: &JobId) -> Option<std::path::PathBuf> {
        if let Some(dir) = self.state().sessions.get(job_id) {
            return Some(dir.clone());
        }
        self.store.read_local(job_id).ok().and_then(|l| l.session_dir)
    }

    /// Drop the uploaded entry from the output list (and its dynamic list) and record it.
    fn record_upload(&self, dtr: &Dtr, session_dir: Option<&Path>) {
        let job_id = &dtr.job_id;
        let target = canonical(dtr.destination());
        let mut outputs = match self.store.read_output(job_id) {
            Ok(outputs) => outputs,
            Err(e) => {
                tracing::warn!(job_id = %job_id, "failed to read list of output files: {:#}", e);
                return;
            }
        };

        let mut uploaded = None;
        if let Some(session_dir) = session_dir {
            for name in outputs.iter().filter_map(FileEntry::dynamic_list) {
                let path = session_path(session_dir, name);
                let mut listed = match self.store.read_dynamic(&path) {
                    Ok(listed) => listed,
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, "failed to read dynamic output list: {:#}", e);
                        continue;
                    }
                };
                let Some(pos) = listed
                    .iter()
                    .position(|e| !e.lfn.is_empty() && canonical(&e.lfn) == target)
                else {
                    continue;
                };
                uploaded = Some(listed.remove(pos));
                if let Err(e) = self.store.write_dynamic(&path, &listed) {
                    tracing::warn!(job_id = %job_id, "failed to update dynamic output list: {:#}", e);
                }
            }
        }

        outputs.retain(|e| {
            let matched = !e.lfn.is_empty() && canonical(&e.lfn) == target;
            if matched {
                uploaded = Some(e.clone());
            }
            !matched
        });
        if let Err(e) = self.store.write_output(job_id, &outputs) {
            tracing::warn!(job_id = %job_id, "failed to write list of output files: {:#}", e);
        }
        let uploaded = uploaded.unwrap_or_else(|| {
            let local = dtr.source_locator().ok().and_then(|l| l.local_path());
            let pfn = match (local, session_dir) {
                (Some(path), Some(dir)) => path
                    .strip_prefix(dir)
                    .map(|rel| rel.display().to_string())
                    .unwrap_or_default(),
                _ => String::new(),
            };
            FileEntry::new(pfn, dtr.destination())
        });
        if let Err(e) = self.store.add_output_status(job_id, &uploaded) {
            tracing::warn!(job_id = %job_id, "failed to record uploaded file: {:#}", e);
        }
    }

    /// Drop the downloaded entry from the input list. Returns the delivered size.
    fn record_download(&self, dtr: &Dtr, session_dir: Option<&Path>) -> Option<u64> {
        let job_id = &dtr.job_id;
        let source = canonical(dtr.source());
        let mut inputs = match self.store.read_input(job_id) {
            Ok(inputs) => inputs,
            Err(e) => {
                tracing::warn!(job_id = %job_id, "failed to read list of input files: {:#}", e);
                return None;
            }
        };
        let pos = inputs
            .iter()
            .position(|e| e.is_remote() && canonical(&e.lfn) == source)?;
        let entry = inputs.remove(pos);
        if let Err(e) = self.store.write_input(job_id, &inputs) {
            tracing::warn!(job_id = %job_id, "failed to write list of input files: {:#}", e);
        }
        session_dir
            .and_then(|dir| fs::metadata(session_path(dir, &entry.pfn)).ok())
            .map(|m| m.len())
    }

    fn finalize(&self, dtr: &Dtr, direction: Direction, session_dir: Option<&Path>) {
        let job_id = &dtr.job_id;
        let failed = {
            let mut st = self.state();
            st.active.remove(job_id);
            st.sessions.remove(job_id);
            st.finished.get(job_id).is_some_and(|e| !e.is_empty())
        };

        match (direction, session_dir) {
            (Direction::Upload, Some(session_dir)) => {
                self.clean_after_upload(job_id, session_dir, failed);
            }
            (Direction::Download, Some(session_dir)) if failed => {
                let inputs = self.store.read_input(job_id).unwrap_or_else(|e| {
                    tracing::warn!(job_id = %job_id, "failed to read list of input files: {:#}", e);
                    Vec::new()
                });
                let remote = inputs.iter().filter(|e| e.is_remote()).map(|e| e.pfn.as_str());
                if let Err(e) = session::remove_listed(session_dir, remote) {
                    tracing::warn!(job_id = %job_id, "failed to clean up session dir: {:#}", e);
                }
            }
            (_, None) => {
                tracing::warn!(job_id = %job_id, "session directory unknown, skipping clean up");
            }
            _ => {}
        }
        // A successful download keeps its cache links while the job runs;
        // they are released once its outputs are staged.
        if direction == Direction::Upload || failed {
            self.release_cache(job_id, &dtr.cache);
        }

        {
            let mut st = self.state();
            let error = st.finished.entry(job_id.clone()).or_default();
            if error.is_empty() {
                tracing::info!(job_id = %job_id, "data staging finished");
            } else {
                tracing::error!(job_id = %job_id, "data staging failed: {}", error.trim_end());
            }
        }
        self.wake(job_id);
    }

    /// Keep only outputs still to be retrieved by the user, including what is
    /// left in dynamic lists. List files themselves are kept only on failure.
    fn clean_after_upload(&self, job_id: &JobId, session_dir: &Path, failed: bool) {
        let outputs = match self.store.read_output(job_id) {
            Ok(outputs) => outputs,
            Err(e) => {
                tracing::warn!(job_id = %job_id, "failed to read list of output files: {:#}", e);
                return;
            }
        };
        let mut keep: Vec<String> = Vec::new();
        for entry in &outputs {
            let Some(name) = entry.dynamic_list() else {
                keep.push(entry.pfn.clone());
                continue;
            };
            if failed {
                keep.push(format!("/{}", name));
            }
            match self.store.read_dynamic(&session_path(session_dir, name)) {
                Ok(listed) => keep.extend(listed.into_iter().map(|e| e.pfn)),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, "failed to read dynamic output list: {:#}", e)
                }
            }
        }
        match session::remove_unlisted(session_dir, keep.iter().map(String::as_str)) {
            Ok(n) => tracing::debug!(job_id = %job_id, removed = n, "cleaned session dir"),
            Err(e) => tracing::warn!(job_id = %job_id, "failed to clean up session dir: {:#}", e),
        }
    }
}
