//! Slot pools: one concurrency ceiling per execution phase.
//!
//! Only the dispatch task touches the pools, so counts are plain integers.

use crate::config::StagingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Pool {
    /// Cache lookup and source resolution.
    Processing,
    /// Byte movement.
    Delivery,
    /// Extra delivery slots for high-priority DTRs when `Delivery` is full.
    Emergency,
    /// Registration and cache storage.
    Prepared,
}

impl Pool {
    const ALL: [Pool; 4] = [Pool::Processing, Pool::Delivery, Pool::Emergency, Pool::Prepared];

    fn index(self) -> usize {
        match self {
            Pool::Processing => 0,
            Pool::Delivery => 1,
            Pool::Emergency => 2,
            Pool::Prepared => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SlotPools {
    limits: [usize; 4],
    in_use: [usize; 4],
}

impl SlotPools {
    pub(crate) fn from_config(cfg: &StagingConfig) -> Self {
        Self {
            limits: [
                cfg.max_processor.max(1),
                cfg.max_delivery.max(1),
                cfg.max_emergency,
                cfg.max_prepared.max(1),
            ],
            in_use: [0; 4],
        }
    }

    pub(crate) fn limit(&self, pool: Pool) -> usize {
        self.limits[pool.index()]
    }

    pub(crate) fn in_use(&self, pool: Pool) -> usize {
        self.in_use[pool.index()]
    }

    pub(crate) fn available(&self, pool: Pool) -> usize {
        self.limit(pool).saturating_sub(self.in_use(pool))
    }

    /// Take one slot; false when the pool is full.
    pub(crate) fn reserve(&mut self, pool: Pool) -> bool {
        if self.available(pool) == 0 {
            return false;
        }
        self.in_use[pool.index()] += 1;
        true
    }

    pub(crate) fn release(&mut self, pool: Pool) {
        let n = &mut self.in_use[pool.index()];
        *n = n.saturating_sub(1);
    }

    pub(crate) fn total_in_use(&self) -> usize {
        Pool::ALL.iter().map(|p| self.in_use(*p)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release_per_pool() {
        let cfg = StagingConfig {
            max_processor: 2,
            max_delivery: 1,
            max_emergency: 0,
            max_prepared: 1,
            ..StagingConfig::default()
        };
        let mut pools = SlotPools::from_config(&cfg);
        assert!(pools.reserve(Pool::Processing));
        assert!(pools.reserve(Pool::Processing));
        assert!(!pools.reserve(Pool::Processing));
        assert_eq!(pools.available(Pool::Processing), 0);
        assert!(pools.reserve(Pool::Delivery));
        assert!(!pools.reserve(Pool::Emergency));
        assert_eq!(pools.total_in_use(), 3);
        pools.release(Pool::Processing);
        assert_eq!(pools.available(Pool::Processing), 1);
        pools.release(Pool::Prepared);
        assert_eq!(pools.in_use(Pool::Prepared), 0);
    }
}
