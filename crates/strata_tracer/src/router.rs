//! Ray router: per-domain queues, greedy selection and forwarding.
//!
//! `filter` splits a batch by target domain. Rays for locally owned domains
//! join that domain's queue; rays for domains owned elsewhere go straight
//! into the away buffer, so no foreign queue outlives a routing pass.
//! `send_away` drains the away buffer once per scheduling iteration.

use std::collections::BTreeMap;
use std::sync::Arc;

use strata_core::{DomainId, OwnershipTable, Rank, RayBatch};

/// Where the rays of one `filter` call went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub queued: usize,
    pub away: usize,
    pub dropped: usize,
}

/// Rays bound for one remote domain.
#[derive(Debug, Clone, PartialEq)]
pub struct Shipment {
    pub owner: Rank,
    pub domain: DomainId,
    pub rays: RayBatch,
}

/// One rank's ray queues.
pub struct RayRouter {
    rank: Rank,
    ownership: Arc<OwnershipTable>,
    queues: BTreeMap<DomainId, RayBatch>,
    away: BTreeMap<DomainId, RayBatch>,
}

impl RayRouter {
    pub fn new(rank: Rank, ownership: Arc<OwnershipTable>) -> Self {
        Self {
            rank,
            ownership,
            queues: BTreeMap::new(),
            away: BTreeMap::new(),
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn ownership(&self) -> &OwnershipTable {
        &self.ownership
    }

    /// Route a batch by target domain.
    ///
    /// Rays whose domain has no owner are dropped and counted.
    pub fn filter(&mut self, rays: RayBatch) -> FilterStats {
        let mut stats = FilterStats::default();
        let mut unknown: BTreeMap<DomainId, usize> = BTreeMap::new();

        for ray in rays {
            match self.ownership.owner(ray.target) {
                Some(owner) if owner == self.rank => {
                    self.queues.entry(ray.target).or_default().push(ray);
                    stats.queued += 1;
                }
                Some(_) => {
                    self.away.entry(ray.target).or_default().push(ray);
                    stats.away += 1;
                }
                None => {
                    *unknown.entry(ray.target).or_default() += 1;
                    stats.dropped += 1;
                }
            }
        }

        for (domain, count) in unknown {
            log::warn!(
                "rank {}: dropped {} ray(s) for domain {} which has no owner",
                self.rank,
                count,
                domain
            );
        }
        stats
    }

    /// The locally owned domain with the most queued rays, lowest id on ties.
    pub fn select_next(&self) -> Option<DomainId> {
        let mut best: Option<(DomainId, usize)> = None;
        for (&domain, rays) in &self.queues {
            if rays.is_empty() {
                continue;
            }
            // BTreeMap iterates in id order, so strict > keeps the lowest id
            if best.map_or(true, |(_, n)| rays.len() > n) {
                best = Some((domain, rays.len()));
            }
        }
        best.map(|(domain, _)| domain)
    }

    /// Take every queued ray for `domain`, leaving its queue empty.
    pub fn take(&mut self, domain: DomainId) -> RayBatch {
        self.queues.remove(&domain).unwrap_or_default()
    }

    /// Drain the away buffer into one shipment per remote domain.
    pub fn send_away(&mut self) -> Vec<Shipment> {
        let away = std::mem::take(&mut self.away);
        away.into_iter()
            .filter(|(_, rays)| !rays.is_empty())
            .filter_map(|(domain, rays)| {
                let owner = self.ownership.owner(domain)?;
                Some(Shipment { owner, domain, rays })
            })
            .collect()
    }

    /// Rays waiting in local queues.
    pub fn queued(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }

    /// Rays waiting in a given local queue.
    pub fn queue_len(&self, domain: DomainId) -> usize {
        self.queues.get(&domain).map_or(0, Vec::len)
    }

    /// Rays waiting to be forwarded.
    pub fn pending_away(&self) -> usize {
        self.away.values().map(Vec::len).sum()
    }

    /// No local or outgoing rays.
    pub fn is_idle(&self) -> bool {
        self.queued() == 0 && self.pending_away() == 0
    }

    /// Discard everything, for the start of a frame.
    pub fn clear(&mut self) {
        self.queues.clear();
        self.away.clear();
    }
}
