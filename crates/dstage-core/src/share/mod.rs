//! Transfer share policy: fairness buckets for DTRs.
//!
//! Every DTR belongs to one transfer share, `<base>-<sub_share>`, where the
//! base is `_default`, the owning user or the job id depending on the share
//! type. Each slot pool is divided between the active shares in proportion to
//! their weights, and slots are granted round-robin across shares.

mod rotation;

use std::collections::BTreeMap;

pub use crate::config::ShareType;
use crate::config::ShareConfig;
use crate::job::{JobId, LocalUser};
pub use rotation::{ShareCandidate, ShareRotation};

pub const DEFAULT_SHARE: &str = "_default";

#[derive(Debug, Clone)]
pub struct TransferShares {
    share_type: ShareType,
    default_priority: u32,
    reference: BTreeMap<String, u32>,
}

impl Default for TransferShares {
    fn default() -> Self {
        Self::from_config(&ShareConfig::default())
    }
}

impl TransferShares {
    pub fn from_config(cfg: &ShareConfig) -> Self {
        Self {
            share_type: cfg.share_type,
            default_priority: cfg.default_priority.max(1),
            reference: cfg.reference.clone(),
        }
    }

    pub fn share_type(&self) -> ShareType {
        self.share_type
    }

    pub fn base_share(&self, job: &JobId, user: &LocalUser) -> String {
        match self.share_type {
            ShareType::None => DEFAULT_SHARE.to_string(),
            ShareType::User => user.label(),
            ShareType::Job => job.to_string(),
        }
    }

    pub fn transfer_share(&self, job: &JobId, user: &LocalUser, sub_share: &str) -> String {
        format!("{}-{}", self.base_share(job, user), sub_share)
    }

    /// Weight of a transfer share: exact reference, then base-name reference, then default.
    pub fn weight(&self, share: &str) -> u32 {
        if let Some(w) = self.reference.get(share) {
            return (*w).max(1);
        }
        share
            .rsplit_once('-')
            .and_then(|(base, _)| self.reference.get(base))
            .map(|w| (*w).max(1))
            .unwrap_or(self.default_priority)
    }

    /// Slots allotted to each active share out of `total_slots`:
    /// `max(1, floor(total * w / sum(w)))`.
    pub fn calculate_shares<'a, I>(&self, active: I, total_slots: usize) -> BTreeMap<String, usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let weights: BTreeMap<String, u64> = active
            .into_iter()
            .map(|s| (s.to_string(), u64::from(self.weight(s))))
            .collect();
        let sum: u64 = weights.values().sum();
        weights
            .into_iter()
            .map(|(share, w)| {
                let n = if sum == 0 {
                    1
                } else {
                    ((total_slots as u64 * w) / sum) as usize
                };
                (share, n.max(1))
            })
            .collect()
    }
}
