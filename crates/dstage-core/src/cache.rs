//! Contract with the shared file cache.
//!
//! The cache is reference counted per job: a job holds links into it from the
//! first cacheable download until its staging is finalized. Only the
//! acquire/release/lookup contract lives here; `JobLinkCache` is a minimal
//! directory-backed implementation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::job::{JobId, LocalUser};

/// Cache directory templates; `%u` uid, `%g` gid, `%U` user name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub cache_dirs: Vec<String>,
    #[serde(default)]
    pub remote_cache_dirs: Vec<String>,
}

impl CacheConfig {
    pub fn substitute(&self, user: &LocalUser) -> CacheParameters {
        CacheParameters {
            cache_dirs: self
                .cache_dirs
                .iter()
                .map(|t| PathBuf::from(substitute_template(t, user)))
                .collect(),
            remote_cache_dirs: self
                .remote_cache_dirs
                .iter()
                .map(|t| substitute_template(t, user))
                .collect(),
        }
    }
}

fn substitute_template(template: &str, user: &LocalUser) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('u') => out.push_str(&user.uid.to_string()),
            Some('g') => out.push_str(&user.gid.to_string()),
            Some('U') => out.push_str(&user.label()),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Cache directories resolved for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheParameters {
    pub cache_dirs: Vec<PathBuf>,
    pub remote_cache_dirs: Vec<String>,
}

impl CacheParameters {
    pub fn is_empty(&self) -> bool {
        self.cache_dirs.is_empty()
    }
}

pub trait FileCache: Send + Sync {
    /// Take (or keep) the job's reference into the cache.
    fn acquire(&self, job: &JobId, params: &CacheParameters) -> Result<()>;

    /// Drop all of the job's references.
    fn release(&self, job: &JobId, params: &CacheParameters) -> Result<()>;

    /// Place a cached copy of `url` at `dest`. Returns false on a cache miss.
    fn fetch(&self, _job: &JobId, _url: &str, _params: &CacheParameters, _dest: &Path) -> Result<bool> {
        Ok(false)
    }

    /// Add a freshly downloaded file to the cache.
    fn store(&self, _job: &JobId, _url: &str, _params: &CacheParameters, _src: &Path) -> Result<()> {
        Ok(())
    }
}

/// Cache disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl FileCache for NoCache {
    fn acquire(&self, _job: &JobId, _params: &CacheParameters) -> Result<()> {
        Ok(())
    }

    fn release(&self, _job: &JobId, _params: &CacheParameters) -> Result<()> {
        Ok(())
    }
}

/// Directory cache using the first configured cache dir.
///
/// Layout: `data/<sha256 of url>` holds cached content, `joblinks/<job_id>/`
/// holds one hard link per file the job uses. A job's reference is the
/// existence of its joblinks directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobLinkCache;

impl JobLinkCache {
    fn root<'a>(&self, params: &'a CacheParameters) -> Option<&'a Path> {
        params.cache_dirs.first().map(PathBuf::as_path)
    }

    fn key(url: &str) -> String {
        hex::encode(Sha256::digest(url.as_bytes()))
    }

    pub fn joblinks_dir(root: &Path, job: &JobId) -> PathBuf {
        root.join("joblinks").join(job.as_str())
    }
}

impl FileCache for JobLinkCache {
    fn acquire(&self, job: &JobId, params: &CacheParameters) -> Result<()> {
        let Some(root) = self.root(params) else {
            return Ok(());
        };
        let dir = Self::joblinks_dir(root, job);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(())
    }

    fn release(&self, job: &JobId, params: &CacheParameters) -> Result<()> {
        let Some(root) = self.root(params) else {
            return Ok(());
        };
        let dir = Self::joblinks_dir(root, job);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::debug!(job_id = %job, dir = %dir.display(), "released cache links");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", dir.display())),
        }
    }

    fn fetch(&self, job: &JobId, url: &str, params: &CacheParameters, dest: &Path) -> Result<bool> {
        let Some(root) = self.root(params) else {
            return Ok(false);
        };
        let key = Self::key(url);
        let cached = root.join("data").join(&key);
        if !cached.is_file() {
            return Ok(false);
        }
        let link = Self::joblinks_dir(root, job).join(&key);
        if !link.exists() {
            fs::hard_link(&cached, &link)
                .with_context(|| format!("link {} into job cache", cached.display()))?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&link, dest).with_context(|| format!("copy cached file to {}", dest.display()))?;
        Ok(true)
    }

    fn store(&self, job: &JobId, url: &str, params: &CacheParameters, src: &Path) -> Result<()> {
        let Some(root) = self.root(params) else {
            return Ok(());
        };
        let data = root.join("data");
        fs::create_dir_all(&data)?;
        let key = Self::key(url);
        let cached = data.join(&key);
        let tmp = data.join(format!("{}.{}.tmp", key, job));
        fs::copy(src, &tmp).with_context(|| format!("copy {} into cache", src.display()))?;
        fs::rename(&tmp, &cached)?;
        let link = Self::joblinks_dir(root, job).join(&key);
        if !link.exists() {
            fs::hard_link(&cached, &link)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_are_substituted_per_user() {
        let cfg = CacheConfig {
            cache_dirs: vec!["/cache/%U/%u".into(), "/plain".into()],
            remote_cache_dirs: vec!["/remote/%g%".into()],
        };
        let params = cfg.substitute(&LocalUser::new(1000, 200, "alice"));
        assert_eq!(
            params.cache_dirs,
            vec![PathBuf::from("/cache/alice/1000"), PathBuf::from("/plain")]
        );
        assert_eq!(params.remote_cache_dirs, vec!["/remote/200%".to_string()]);
        let anon = cfg.substitute(&LocalUser::new(7, 7, ""));
        assert_eq!(anon.cache_dirs[0], PathBuf::from("/cache/uid7/7"));
    }

    #[test]
    fn job_links_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let params = CacheParameters {
            cache_dirs: vec![dir.path().to_path_buf()],
            remote_cache_dirs: Vec::new(),
        };
        let job = JobId::new("J1");
        let cache = JobLinkCache;
        cache.acquire(&job, &params).unwrap();
        assert!(dir.path().join("joblinks/J1").is_dir());
        cache.release(&job, &params).unwrap();
        assert!(!dir.path().join("joblinks/J1").exists());
        cache.release(&job, &params).unwrap();
    }

    #[test]
    fn stored_file_is_served_to_next_job() {
        let dir = tempfile::tempdir().unwrap();
        let params = CacheParameters {
            cache_dirs: vec![dir.path().join("cache")],
            remote_cache_dirs: Vec::new(),
        };
        let cache = JobLinkCache;
        let src = dir.path().join("downloaded");
        fs::write(&src, b"payload").unwrap();
        let j1 = JobId::new("J1");
        cache.acquire(&j1, &params).unwrap();
        cache.store(&j1, "http://host/a", &params, &src).unwrap();

        let j2 = JobId::new("J2");
        cache.acquire(&j2, &params).unwrap();
        let dest = dir.path().join("ws/J2/a");
        assert!(cache.fetch(&j2, "http://host/a", &params, &dest).unwrap());
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        assert!(!cache
            .fetch(&j2, "http://host/other", &params, &dest)
            .unwrap());
    }

    #[test]
    fn no_cache_never_hits() {
        let params = CacheParameters::default();
        let job = JobId::new("J");
        assert!(!NoCache.fetch(&job, "http://h/a", &params, Path::new("/x")).unwrap());
        NoCache.acquire(&job, &params).unwrap();
    }
}
