//! Job descriptor handed over by the job lifecycle manager.
//!
//! The generator only keeps a copy of the identifying fields; the job manager
//! owns the real job and its state transitions.

use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

/// Job identifier assigned by the job manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local account owning the job's session directory.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LocalUser {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
}

impl LocalUser {
    pub fn new(uid: u32, gid: u32, name: impl Into<String>) -> Self {
        Self {
            uid,
            gid,
            name: name.into(),
        }
    }

    /// Name used in share labels and cache templates; `uid<N>` when the account has no name.
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            format!("uid{}", self.uid)
        } else {
            self.name.clone()
        }
    }
}

/// Lifecycle state as seen by data staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Staging-in: input files are downloaded into the session directory.
    Preparing,
    /// Staging-out: output files are uploaded from the session directory.
    Finishing,
    /// Any other lifecycle state; staging such a job is a logic error.
    Other(String),
}

impl JobState {
    pub fn name(&self) -> &str {
        match self {
            JobState::Preparing => "PREPARING",
            JobState::Finishing => "FINISHING",
            JobState::Other(name) => name,
        }
    }
}

pub const DEFAULT_PRIORITY: i32 = 50;

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub user: LocalUser,
    pub session_dir: PathBuf,
    pub state: JobState,
    /// 1..=100, higher runs first.
    pub priority: i32,
    /// When the job entered its current state; user-file waits are timed from here.
    pub start_time: SystemTime,
    failures: Vec<String>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        user: LocalUser,
        session_dir: impl Into<PathBuf>,
        state: JobState,
    ) -> Self {
        Self {
            id: JobId::new(id),
            user,
            session_dir: session_dir.into(),
            state,
            priority: DEFAULT_PRIORITY,
            start_time: SystemTime::now(),
            failures: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority.clamp(1, 100);
        self
    }

    pub fn add_failure(&mut self, failure: impl Into<String>) {
        self.failures.push(failure.into());
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn is_staging_in(&self) -> bool {
        self.state == JobState::Preparing
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_compare_by_id() {
        let user = LocalUser::new(1000, 1000, "alice");
        let a = Job::new("J1", user.clone(), "/ws/J1", JobState::Preparing);
        let b = Job::new("J1", user, "/elsewhere", JobState::Finishing).with_priority(80);
        assert_eq!(a, b);
    }

    #[test]
    fn priority_is_clamped() {
        let job = Job::new("J", LocalUser::new(0, 0, ""), "/ws/J", JobState::Preparing);
        assert_eq!(job.clone().with_priority(500).priority, 100);
        assert_eq!(job.with_priority(-3).priority, 1);
    }

    #[test]
    fn user_label_falls_back_to_uid() {
        assert_eq!(LocalUser::new(42, 42, "").label(), "uid42");
        assert_eq!(LocalUser::new(42, 42, "bob").label(), "bob");
    }
}
