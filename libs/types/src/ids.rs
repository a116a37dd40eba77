//! Identifier and cost primitives

use std::collections::BTreeSet;
use std::fmt;

/// Stream topic identifier
pub type TopicId = u64;

/// Endpoint address identifier
pub type AddressId = u64;

/// Port on an addressed endpoint
pub type Port = u64;

/// Additive route cost. Accumulates along a path, saturating at `u32::MAX`.
pub type Cost = u32;

/// An identifier paired with the cost of reaching it.
///
/// Ordering is by id first, then cost, so a `BTreeSet<PricedId>` groups all
/// prices for the same id together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PricedId {
    pub id: u64,
    pub cost: Cost,
}

impl PricedId {
    pub const fn new(id: u64, cost: Cost) -> Self {
        Self { id, cost }
    }

    /// Price after traversing one more hop of `extra` cost
    pub fn with_added_cost(self, extra: Cost) -> Self {
        Self {
            id: self.id,
            cost: self.cost.saturating_add(extra),
        }
    }
}

impl fmt::Display for PricedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.cost)
    }
}

/// Price every id in `ids` at the same `cost`
pub fn ids_to_priced_ids(ids: impl IntoIterator<Item = u64>, cost: Cost) -> BTreeSet<PricedId> {
    ids.into_iter().map(|id| PricedId::new(id, cost)).collect()
}
