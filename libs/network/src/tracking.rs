//! Refcounted id sets
//!
//! Both trackers report only *effective* transitions so callers react to what
//! actually changed and not to every redundant advertisement:
//!
//! - [`IdTracker`]: plain ids, reports 0↔1 refcount crossings.
//! - [`PricedIdTracker`]: ids contributed at several costs, reports changes to
//!   the minimum cost per id.
//!
//! Removing more than was added is a protocol invariant violation. It is
//! logged at `error` and asserts in debug builds.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use mesh_types::{Cost, PricedId};
use tracing::error;

fn report_underflow(tracker: &'static str, id: u64, cost: Option<Cost>) {
    error!(tracker, id, ?cost, "Refcount underflow: remove without matching add");
    debug_assert!(false, "{tracker} refcount underflow for id {id}");
}

/// Refcounted set of ids
#[derive(Debug, Clone, Default)]
pub struct IdTracker {
    counts: HashMap<u64, usize>,
}

impl IdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment each id; returns ids that went from absent to present
    pub fn add_many(&mut self, ids: impl IntoIterator<Item = u64>) -> BTreeSet<u64> {
        let mut added = BTreeSet::new();
        for id in ids {
            let count = self.counts.entry(id).or_insert(0);
            *count += 1;
            if *count == 1 {
                added.insert(id);
            }
        }
        added
    }

    /// Decrement each id; returns ids that went from present to absent
    pub fn remove_many(&mut self, ids: impl IntoIterator<Item = u64>) -> BTreeSet<u64> {
        let mut removed = BTreeSet::new();
        for id in ids {
            match self.counts.get_mut(&id) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    self.counts.remove(&id);
                    removed.insert(id);
                }
                None => report_underflow("IdTracker", id, None),
            }
        }
        removed
    }

    /// Drop every id entirely regardless of refcount; returns ids that were present
    pub fn remove_all(&mut self, ids: impl IntoIterator<Item = u64>) -> BTreeSet<u64> {
        ids.into_iter()
            .filter(|id| self.counts.remove(id).is_some())
            .collect()
    }

    /// Apply `add` then `remove`; returns `(added, removed)` transitions.
    ///
    /// An id that both appears and disappears within the call is reported in
    /// neither set.
    pub fn change_many(
        &mut self,
        add: impl IntoIterator<Item = u64>,
        remove: impl IntoIterator<Item = u64>,
    ) -> (BTreeSet<u64>, BTreeSet<u64>) {
        let mut added = self.add_many(add);
        let mut removed = self.remove_many(remove);
        let transient: Vec<u64> = added.intersection(&removed).copied().collect();
        for id in transient {
            added.remove(&id);
            removed.remove(&id);
        }
        (added, removed)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.counts.contains_key(&id)
    }

    pub fn count(&self, id: u64) -> usize {
        self.counts.get(&id).copied().unwrap_or(0)
    }

    pub fn items(&self) -> BTreeSet<u64> {
        self.counts.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Ids contributed at possibly many costs, exposing the minimum per id.
///
/// Each `(id, cost)` pair is refcounted independently so that several links
/// advertising the same id at the same cost are tracked as separate
/// contributions.
#[derive(Debug, Clone, Default)]
pub struct PricedIdTracker {
    contributions: HashMap<u64, BTreeMap<Cost, usize>>,
    minimums: HashMap<u64, Cost>,
}

impl PricedIdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add contributions; returns `(id, new_minimum)` for ids whose minimum
    /// appeared or decreased
    pub fn add_many(&mut self, ids: impl IntoIterator<Item = PricedId>) -> BTreeSet<PricedId> {
        let mut changed = BTreeMap::new();
        for PricedId { id, cost } in ids {
            *self
                .contributions
                .entry(id)
                .or_default()
                .entry(cost)
                .or_insert(0) += 1;

            let lowered = self.minimums.get(&id).map_or(true, |min| cost < *min);
            if lowered {
                self.minimums.insert(id, cost);
                changed.insert(id, cost);
            }
        }
        to_priced(changed)
    }

    /// Remove contributions; returns `(removed_ids, updated_minimums)`
    pub fn remove_many(
        &mut self,
        ids: impl IntoIterator<Item = PricedId>,
    ) -> (BTreeSet<u64>, BTreeSet<PricedId>) {
        let mut removed = BTreeSet::new();
        let mut updated = BTreeMap::new();

        for PricedId { id, cost } in ids {
            let Some(costs) = self.contributions.get_mut(&id) else {
                report_underflow("PricedIdTracker", id, Some(cost));
                continue;
            };
            match costs.get_mut(&cost) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    continue;
                }
                Some(_) => {
                    costs.remove(&cost);
                }
                None => {
                    report_underflow("PricedIdTracker", id, Some(cost));
                    continue;
                }
            }

            match costs.keys().next().copied() {
                None => {
                    self.contributions.remove(&id);
                    self.minimums.remove(&id);
                    updated.remove(&id);
                    removed.insert(id);
                }
                Some(new_min) => {
                    if self.minimums.insert(id, new_min) != Some(new_min) {
                        updated.insert(id, new_min);
                    }
                }
            }
        }

        (removed, to_priced(updated))
    }

    /// Apply `remove` then `add`; returns `(changed, removed)` where `changed`
    /// holds the current minimum of every id whose minimum differs from
    /// before the call, and `removed` the ids no longer present at all.
    pub fn change_many(
        &mut self,
        add: impl IntoIterator<Item = PricedId>,
        remove: impl IntoIterator<Item = PricedId>,
    ) -> (BTreeSet<PricedId>, BTreeSet<u64>) {
        let add: Vec<PricedId> = add.into_iter().collect();
        let remove: Vec<PricedId> = remove.into_iter().collect();

        let before: BTreeMap<u64, Option<Cost>> = add
            .iter()
            .chain(remove.iter())
            .map(|priced| (priced.id, self.get(priced.id)))
            .collect();

        self.remove_many(remove);
        self.add_many(add);

        let mut changed = BTreeSet::new();
        let mut removed = BTreeSet::new();
        for (id, previous) in before {
            match (previous, self.get(id)) {
                (Some(_), None) => {
                    removed.insert(id);
                }
                (previous, Some(current)) if previous != Some(current) => {
                    changed.insert(PricedId::new(id, current));
                }
                _ => {}
            }
        }
        (changed, removed)
    }

    /// Current minimum cost for `id`
    pub fn get(&self, id: u64) -> Option<Cost> {
        self.minimums.get(&id).copied()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.minimums.contains_key(&id)
    }

    /// Every id at its current minimum
    pub fn items(&self) -> BTreeSet<PricedId> {
        self.minimums
            .iter()
            .map(|(id, cost)| PricedId::new(*id, *cost))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.minimums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.minimums.is_empty()
    }
}

fn to_priced(map: BTreeMap<u64, Cost>) -> BTreeSet<PricedId> {
    map.into_iter()
        .map(|(id, cost)| PricedId::new(id, cost))
        .collect()
}
