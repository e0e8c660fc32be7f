//! Eviction policy: the time-grace cleanup list and the primitive budget.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::node::NodeId;

/// Nodes awaiting disposal, oldest first.
///
/// A node enters the list when it goes invisible and leaves it either by
/// becoming visible again or by staying invisible past the delay.
#[derive(Debug)]
pub struct CleanupList {
    entries: VecDeque<(NodeId, Instant)>,
    delay: Duration,
}

impl CleanupList {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            delay,
        }
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Add `node`, stamped at `since`. Does nothing if it is already listed.
    pub fn push(&mut self, node: NodeId, since: Instant) {
        if self.contains(node) {
            return;
        }
        let at = self.entries.partition_point(|(_, t)| *t <= since);
        self.entries.insert(at, (node, since));
    }

    /// Drop `node` from the list. Returns whether it was listed.
    pub fn remove(&mut self, node: NodeId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(id, _)| *id != node);
        self.entries.len() != before
    }

    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        self.entries.iter().any(|(id, _)| *id == node)
    }

    /// Remove and return every node whose grace period was exceeded at `now`.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<NodeId> {
        let mut expired = Vec::new();
        while let Some((id, since)) = self.entries.front().copied() {
            if now.saturating_duration_since(since) <= self.delay {
                break;
            }
            self.entries.pop_front();
            expired.push(id);
        }
        expired
    }

    pub fn retain(&mut self, mut keep: impl FnMut(NodeId) -> bool) {
        self.entries.retain(|(id, _)| keep(*id));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How displayed primitives are cut down when over budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BudgetStrategy {
    /// Scale every node's draw count by `budget / total`. Requires sources
    /// whose points are evenly distributed within a node.
    Proportional,
    /// Keep the highest-SSE nodes whole and hide the rest.
    ImportanceRanked,
}

/// Ceiling on primitives displayed by one entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PointBudget {
    pub limit: u64,
    pub strategy: BudgetStrategy,
}

/// A displayed node competing for the budget.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BudgetCandidate {
    pub node: NodeId,
    pub count: u64,
    pub sse: f64,
}

/// Draw count allotted to each candidate; 0 hides the node.
///
/// Under budget every node keeps its full count. The sum of allotments never
/// exceeds `budget`.
#[must_use]
pub fn apply_point_budget(
    candidates: &[BudgetCandidate],
    budget: u64,
    strategy: BudgetStrategy,
) -> Vec<(NodeId, u64)> {
    let total: u64 = candidates.iter().map(|c| c.count).sum();
    if total <= budget {
        return candidates.iter().map(|c| (c.node, c.count)).collect();
    }

    match strategy {
        BudgetStrategy::Proportional => candidates
            .iter()
            .map(|c| {
                let scaled = u128::from(c.count) * u128::from(budget) / u128::from(total);
                (c.node, scaled as u64)
            })
            .collect(),
        BudgetStrategy::ImportanceRanked => {
            let mut ranked: Vec<&BudgetCandidate> = candidates.iter().collect();
            ranked.sort_by(|a, b| b.sse.total_cmp(&a.sse));

            let mut used = 0u64;
            let mut exhausted = false;
            ranked
                .into_iter()
                .map(|c| {
                    if !exhausted && used + c.count <= budget {
                        used += c.count;
                        (c.node, c.count)
                    } else {
                        exhausted = true;
                        (c.node, 0)
                    }
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn ids(n: usize) -> Vec<NodeId> {
        let mut map: SlotMap<NodeId, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn test_cleanup_expires_oldest_first() {
        let ids = ids(3);
        let t0 = Instant::now();
        let mut list = CleanupList::new(Duration::from_secs(1));
        list.push(ids[0], t0);
        list.push(ids[1], t0 + Duration::from_millis(500));
        list.push(ids[2], t0 + Duration::from_millis(1500));

        assert!(list.drain_expired(t0 + Duration::from_millis(999)).is_empty());
        assert_eq!(list.drain_expired(t0 + Duration::from_millis(1600)), vec![ids[0], ids[1]]);
        assert_eq!(list.len(), 1);
    }

    /// Re-stamping an already listed node keeps its original timestamp.
    #[test]
    fn test_cleanup_push_is_idempotent() {
        let ids = ids(1);
        let t0 = Instant::now();
        let mut list = CleanupList::new(Duration::from_secs(1));
        list.push(ids[0], t0);
        list.push(ids[0], t0 + Duration::from_secs(5));
        assert_eq!(list.len(), 1);
        assert_eq!(list.drain_expired(t0 + Duration::from_millis(1001)), vec![ids[0]]);
    }

    /// A node is kept for the whole delay and released only once it is exceeded.
    #[test]
    fn test_cleanup_waits_past_delay() {
        let ids = ids(1);
        let t0 = Instant::now();
        let mut list = CleanupList::new(Duration::from_secs(1));
        list.push(ids[0], t0);
        assert!(list.drain_expired(t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(list.drain_expired(t0 + Duration::from_millis(1001)), vec![ids[0]]);
    }

    /// A node removed before its delay elapses is never returned.
    #[test]
    fn test_cleanup_remove_cancels_deletion() {
        let ids = ids(2);
        let t0 = Instant::now();
        let mut list = CleanupList::new(Duration::from_secs(1));
        list.push(ids[0], t0);
        list.push(ids[1], t0);
        assert!(list.remove(ids[0]));
        assert!(!list.remove(ids[0]));
        assert_eq!(list.drain_expired(t0 + Duration::from_secs(2)), vec![ids[1]]);
    }

    fn candidates(counts_and_sse: &[(u64, f64)]) -> Vec<BudgetCandidate> {
        ids(counts_and_sse.len())
            .into_iter()
            .zip(counts_and_sse)
            .map(|(node, (count, sse))| BudgetCandidate {
                node,
                count: *count,
                sse: *sse,
            })
            .collect()
    }

    #[test]
    fn test_under_budget_keeps_everything() {
        let c = candidates(&[(100, 1.0), (200, 2.0)]);
        let out = apply_point_budget(&c, 1000, BudgetStrategy::ImportanceRanked);
        assert_eq!(out.iter().map(|(_, n)| n).sum::<u64>(), 300);
    }

    /// Proportional scaling floors each count and hides nodes that reach zero.
    #[test]
    fn test_proportional_budget() {
        let c = candidates(&[(1000, 1.0), (3000, 1.0), (3, 1.0)]);
        let out = apply_point_budget(&c, 1000, BudgetStrategy::Proportional);
        let counts: Vec<u64> = out.iter().map(|(_, n)| *n).collect();
        assert_eq!(counts, vec![249, 749, 0]);
        assert!(counts.iter().sum::<u64>() <= 1000);
    }

    /// Ranked admission stops at the first node that does not fit.
    #[test]
    fn test_importance_ranked_budget() {
        let c = candidates(&[(400, 1.0), (500, 9.0), (300, 5.0), (50, 0.5)]);
        let out = apply_point_budget(&c, 1000, BudgetStrategy::ImportanceRanked);
        let by_node = |i: usize| out.iter().find(|(id, _)| *id == c[i].node).map(|(_, n)| *n);
        assert_eq!(by_node(1), Some(500));
        assert_eq!(by_node(2), Some(300));
        assert_eq!(by_node(0), Some(0));
        assert_eq!(by_node(3), Some(0));
        assert!(out.iter().map(|(_, n)| n).sum::<u64>() <= 1000);
    }
}
