//! Job → DTR translation.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::{stats, Inner};
use crate::dtr::{Direction, Dtr};
use crate::file_list::FileEntry;
use crate::job::{Job, JobState};
use crate::session::{self, session_path};
use crate::url_model::Locator;

impl Inner {
    /// Read the job's lists and build its DTRs. `Err` carries the job failure text.
    pub(super) fn translate(&self, job: &Job) -> Result<Vec<Dtr>, String> {
        if let Err(e) = stats::touch(&self.store.statistics_path(&job.id)) {
            tracing::warn!(job_id = %job.id, "{:#}", e);
        }
        let outputs = self.store.read_output(&job.id).map_err(|e| {
            tracing::error!(job_id = %job.id, "{:#}", e);
            "Failed to read list of output files".to_string()
        })?;

        let (files, direction, replication) = match &job.state {
            JobState::Preparing => {
                let inputs = self.prepare_inputs(job, &outputs)?;
                (inputs, Direction::Download, false)
            }
            JobState::Finishing => {
                let (outputs, replication) = self.prepare_outputs(job, outputs)?;
                (outputs, Direction::Upload, replication)
            }
            JobState::Other(_) => {
                return Err("Logic error: data staging received job in a bad state".into());
            }
        };

        let params = self.cache_config.substitute(&job.user);
        let share = self
            .shares
            .transfer_share(&job.id, &job.user, direction.sub_share());
        let proxy = self.store.proxy_path(&job.id);
        let mut recovered = self
            .recovered
            .lock()
            .map_err(|_| "Logic error: recovery list unavailable".to_string())?;

        let mut dtrs = Vec::new();
        for entry in files.iter().filter(|f| f.is_remote()) {
            let local = format!(
                "file:{}",
                session_path(&job.session_dir, &entry.pfn).display()
            );
            let (source, mut destination) = match direction {
                Direction::Download => (entry.lfn.clone(), local),
                Direction::Upload => (local, entry.lfn.clone()),
            };
            if let Some(pos) = recovered.iter().position(|d| d == &destination) {
                recovered.remove(pos);
                if let Ok(loc) = Locator::parse(&destination) {
                    tracing::info!(job_id = %job.id, "overwriting {} left by an interrupted transfer", destination);
                    destination = loc.with_option("overwrite", "yes").to_string();
                }
            }

            let mut dtr = Dtr::new(job.id.clone(), source, destination, job.user.clone());
            dtr.sub_share = direction.sub_share().to_string();
            dtr.transfer_share = share.clone();
            dtr.priority = job.priority;
            dtr.tries_left = self.max_retries;
            dtr.force_registration = replication;
            dtr.cache = params.clone();
            dtr.credential = match &entry.cred {
                Some(cred) if !cred.is_empty() => Some(cred.into()),
                _ if proxy.exists() => Some(proxy.clone()),
                _ => None,
            };
            tracing::debug!(
                job_id = %job.id,
                dtr_id = %dtr.id,
                "new DTR {} -> {}",
                dtr.source(),
                dtr.destination()
            );
            dtrs.push(dtr);
        }
        Ok(dtrs)
    }

    fn prepare_inputs(&self, job: &Job, outputs: &[FileEntry]) -> Result<Vec<FileEntry>, String> {
        let mut inputs = self.store.read_input(&job.id).map_err(|e| {
            tracing::error!(job_id = %job.id, "{:#}", e);
            "Failed to read list of input files".to_string()
        })?;

        let mut seen = HashSet::new();
        for entry in &inputs {
            if !seen.insert(entry.pfn.as_str()) {
                return Err(format!("Duplicate file in list of input files: {}", entry.pfn));
            }
        }

        let output_pfns: HashSet<&str> = outputs.iter().map(|o| o.pfn.as_str()).collect();
        for entry in inputs.iter_mut().filter(|e| e.is_remote()) {
            if !output_pfns.contains(entry.pfn.as_str()) {
                continue;
            }
            let Ok(loc) = Locator::parse(&entry.lfn) else {
                continue;
            };
            if matches!(loc.option("cache"), Some("no" | "renew" | "copy")) {
                continue;
            }
            // The job may modify the file, so it must not be a link into the cache.
            entry.lfn = loc.with_option("cache", "copy").to_string();
        }

        let remote = inputs.iter().filter(|e| e.is_remote()).map(|e| e.pfn.as_str());
        if let Err(e) = session::remove_listed(&job.session_dir, remote) {
            tracing::error!(job_id = %job.id, "{:#}", e);
            return Err("Failed to clean up session dir before downloading inputs".into());
        }
        Ok(inputs)
    }

    /// Expand dynamic lists, validate destinations, and clean the session of
    /// anything not listed. Returns the outputs and whether they replicate.
    fn prepare_outputs(
        &self,
        job: &Job,
        declared: Vec<FileEntry>,
    ) -> Result<(Vec<FileEntry>, bool), String> {
        let outputs = expand_dynamic(self, &job.session_dir, declared).map_err(|e| {
            tracing::error!(job_id = %job.id, "{}", e);
            e
        })?;

        let mut lfns = HashSet::new();
        let mut by_url: HashMap<String, &str> = HashMap::new();
        let mut replication = false;
        for entry in outputs.iter().filter(|e| !e.lfn.is_empty()) {
            if !lfns.insert(entry.lfn.as_str()) {
                return Err(format!("Two identical output destinations: {}", entry.lfn));
            }
            if !entry.is_remote() {
                continue;
            }
            let Ok(loc) = Locator::parse(&entry.lfn) else {
                continue;
            };
            match by_url.get(&loc.canonical()) {
                Some(pfn) if *pfn != entry.pfn => {
                    return Err(format!(
                        "Cannot upload two different files to same LFN: {}",
                        entry.lfn
                    ));
                }
                Some(_) => replication = true,
                None => {
                    by_url.insert(loc.canonical(), entry.pfn.as_str());
                }
            }
        }

        let keep = outputs.iter().map(|e| e.pfn.as_str());
        if let Err(e) = session::remove_unlisted(&job.session_dir, keep) {
            tracing::error!(job_id = %job.id, "{:#}", e);
            return Err("Failed to clean up session dir before uploading outputs".into());
        }
        Ok((outputs, replication))
    }
}

/// Replace each `/@name` entry by the list file itself followed by its content.
fn expand_dynamic(
    inner: &Inner,
    session_dir: &Path,
    declared: Vec<FileEntry>,
) -> Result<Vec<FileEntry>, String> {
    let mut outputs = Vec::with_capacity(declared.len());
    for entry in declared {
        let (Some(name), Some(list_entry)) = (entry.dynamic_list(), entry.list_file_entry()) else {
            outputs.push(entry);
            continue;
        };
        let listed = inner
            .store
            .read_dynamic(&session_path(session_dir, name))
            .map_err(|e| {
                tracing::error!("error reading user generated output file list: {:#}", e);
                "Error reading user generated output file list".to_string()
            })?;
        outputs.push(list_entry);
        for item in listed {
            if item.dynamic_list().is_some() {
                return Err(format!(
                    "Nested dynamic output list is not supported: {}",
                    item.pfn
                ));
            }
            outputs.push(item);
        }
    }
    Ok(outputs)
}
