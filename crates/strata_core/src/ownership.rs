//! Instance ownership table.
//!
//! Maps every domain id to the rank that owns it. Built once before the
//! first frame; every rank holds an identical copy and nothing mutates it
//! afterwards.

use std::collections::BTreeMap;

use crate::ray::DomainId;

/// Index of a participating process.
pub type Rank = usize;

/// Immutable domain → owning rank mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnershipTable {
    owners: BTreeMap<DomainId, Rank>,
}

impl OwnershipTable {
    /// Build from explicit `(domain, owner)` pairs. Later pairs win.
    pub fn from_assignments(assignments: impl IntoIterator<Item = (DomainId, Rank)>) -> Self {
        Self {
            owners: assignments.into_iter().collect(),
        }
    }

    /// Assign `domain_count` domains to `num_ranks` ranks round-robin by id.
    pub fn round_robin(domain_count: usize, num_ranks: usize) -> Self {
        let num_ranks = num_ranks.max(1);
        Self::from_assignments((0..domain_count).map(|id| (id as DomainId, id % num_ranks)))
    }

    /// Owner of a domain, or `None` if the domain is not in the table.
    #[inline]
    pub fn owner(&self, domain: DomainId) -> Option<Rank> {
        self.owners.get(&domain).copied()
    }

    /// Returns true if `rank` owns `domain`.
    #[inline]
    pub fn is_owned_by(&self, domain: DomainId, rank: Rank) -> bool {
        self.owner(domain) == Some(rank)
    }

    /// Domains owned by `rank`, in ascending id order.
    pub fn owned_by(&self, rank: Rank) -> Vec<DomainId> {
        self.owners
            .iter()
            .filter(|(_, owner)| **owner == rank)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Number of domains in the table.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
