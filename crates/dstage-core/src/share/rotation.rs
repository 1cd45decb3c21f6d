use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

use crate::dtr::Dtr;

/// What the rotation needs to know about a waiting item.
pub trait ShareCandidate {
    fn share(&self) -> &str;
    fn priority(&self) -> i32;
    fn created_at(&self) -> DateTime<Utc>;
}

impl ShareCandidate for Dtr {
    fn share(&self) -> &str {
        &self.transfer_share
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl<T: ShareCandidate> ShareCandidate for &T {
    fn share(&self) -> &str {
        (**self).share()
    }

    fn priority(&self) -> i32 {
        (**self).priority()
    }

    fn created_at(&self) -> DateTime<Utc> {
        (**self).created_at()
    }
}

/// Round-robin slot granting across shares for one slot pool.
#[derive(Debug, Default, Clone)]
pub struct ShareRotation {
    last: Option<String>,
}

impl ShareRotation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose the next candidate to receive a slot; returns its index.
    ///
    /// Shares are visited in name order starting after the last granted one.
    /// The first share still below its allotment wins; when every share is at
    /// its allotment the first non-empty share does. Within a share the
    /// highest priority, then the oldest, candidate is chosen.
    pub fn pick<T: ShareCandidate>(
        &mut self,
        candidates: &[T],
        running: &HashMap<String, usize>,
        allotment: &BTreeMap<String, usize>,
    ) -> Option<usize> {
        let mut best: BTreeMap<&str, usize> = BTreeMap::new();
        for (i, c) in candidates.iter().enumerate() {
            best.entry(c.share())
                .and_modify(|cur| {
                    if outranks(c, &candidates[*cur]) {
                        *cur = i;
                    }
                })
                .or_insert(i);
        }
        if best.is_empty() {
            return None;
        }

        let names: Vec<&str> = best.keys().copied().collect();
        let start = match &self.last {
            Some(last) => names.iter().position(|n| *n > last.as_str()).unwrap_or(0),
            None => 0,
        };
        let order = names[start..].iter().chain(names[..start].iter());

        let mut fallback = None;
        let mut chosen = None;
        for name in order {
            fallback.get_or_insert(*name);
            let used = running.get(*name).copied().unwrap_or(0);
            let limit = allotment.get(*name).copied().unwrap_or(1);
            if used < limit {
                chosen = Some(*name);
                break;
            }
        }
        let share = chosen.or(fallback)?;
        self.last = Some(share.to_string());
        best.get(share).copied()
    }
}

fn outranks<T: ShareCandidate>(a: &T, b: &T) -> bool {
    a.priority() > b.priority() || (a.priority() == b.priority() && a.created_at() < b.created_at())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        share: &'static str,
        priority: i32,
        age_secs: i64,
    }

    impl ShareCandidate for Item {
        fn share(&self) -> &str {
            self.share
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn created_at(&self) -> DateTime<Utc> {
            DateTime::<Utc>::from_timestamp(1_000_000 - self.age_secs, 0).unwrap()
        }
    }

    fn item(share: &'static str, priority: i32, age_secs: i64) -> Item {
        Item {
            share,
            priority,
            age_secs,
        }
    }

    fn alloc(pairs: &[(&str, usize)]) -> BTreeMap<String, usize> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn highest_priority_then_oldest() {
        let items = vec![item("a", 50, 10), item("a", 80, 1), item("a", 80, 5)];
        let mut rot = ShareRotation::new();
        let idx = rot.pick(&items, &HashMap::new(), &alloc(&[("a", 5)]));
        assert_eq!(idx, Some(2));
    }

    #[test]
    fn rotates_across_shares() {
        let items = vec![item("a", 50, 3), item("a", 50, 2), item("b", 50, 1)];
        let allot = alloc(&[("a", 5), ("b", 5)]);
        let running = HashMap::new();
        let mut rot = ShareRotation::new();
        assert_eq!(rot.pick(&items, &running, &allot), Some(0));
        assert_eq!(rot.pick(&items, &running, &allot), Some(2));
        assert_eq!(rot.pick(&items, &running, &allot), Some(0));
    }

    #[test]
    fn full_share_is_skipped_while_another_has_room() {
        let items = vec![item("a", 100, 9), item("b", 1, 1)];
        let allot = alloc(&[("a", 1), ("b", 1)]);
        let running: HashMap<String, usize> = [("a".to_string(), 1)].into_iter().collect();
        let mut rot = ShareRotation::new();
        assert_eq!(rot.pick(&items, &running, &allot), Some(1));
    }

    #[test]
    fn falls_back_when_all_shares_are_at_allotment() {
        let items = vec![item("a", 50, 1)];
        let allot = alloc(&[("a", 1)]);
        let running: HashMap<String, usize> = [("a".to_string(), 3)].into_iter().collect();
        let mut rot = ShareRotation::new();
        assert_eq!(rot.pick(&items, &running, &allot), Some(0));
        assert_eq!(rot.pick::<Item>(&[], &running, &allot), None);
    }
}
