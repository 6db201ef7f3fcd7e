//! Domain tracer: one rank's share of a frame.
//!
//! A frame runs GENERATE and ROUTE once, then loops SELECT, TRACE and
//! SHUFFLE, ending every pass with SendAway. The caller owns the
//! termination step because it needs the communicator; this type only
//! reports what each pass did.

use std::sync::Arc;
use std::time::Instant;

use strata_core::{Color, DomainId, Film, OwnershipTable, Rank, RayBatch, Scene, Tile};

use crate::adapter::{AdapterFactory, AdapterSlot};
use crate::camera::Camera;
use crate::counters::{RayCountSnapshot, RayCounters};
use crate::error::TraceError;
use crate::profiler::{Phase, Profiler};
use crate::router::{FilterStats, RayRouter, Shipment};
use crate::termination::Termination;

/// What one SELECT/TRACE/SHUFFLE pass did.
#[derive(Debug, Default)]
pub struct Iteration {
    /// Domain traced this pass, if any had rays
    pub domain: Option<DomainId>,
    pub traced: usize,
    pub continuations: usize,
    pub dropped: usize,
    /// Rays to forward, drained from the router by SendAway
    pub shipments: Vec<Shipment>,
}

impl Iteration {
    pub fn did_work(&self) -> bool {
        self.domain.is_some()
    }

    pub fn shipped(&self) -> usize {
        self.shipments.iter().map(|s| s.rays.len()).sum()
    }
}

/// Per-rank frame driver.
pub struct DomainTracer {
    rank: Rank,
    scene: Arc<Scene>,
    router: RayRouter,
    slot: AdapterSlot,
    film: Film,
    counters: Arc<RayCounters>,
    profiler: Profiler,
    termination: Termination,
    frame_start: Option<Instant>,
    iterations: u64,
}

impl DomainTracer {
    pub fn new(
        rank: Rank,
        scene: Arc<Scene>,
        ownership: Arc<OwnershipTable>,
        factory: Box<dyn AdapterFactory>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            rank,
            scene,
            router: RayRouter::new(rank, ownership),
            slot: AdapterSlot::new(factory),
            film: Film::new(width, height),
            counters: Arc::new(RayCounters::new()),
            profiler: Profiler::new(),
            termination: Termination::new(),
            frame_start: None,
            iterations: 0,
        }
    }

    /// Start a frame: GENERATE primary rays for `tile`, then ROUTE them.
    ///
    /// Primaries that miss every domain deposit the background directly.
    pub fn generate(&mut self, camera: &Camera, tile: &Tile, seed: u64) -> FilterStats {
        self.begin_frame();
        let primaries = self.profiler.time(Phase::GenPrimaryRays, || camera.generate(tile, seed));
        self.counters.add_produced(primaries.len() as u64);

        let mut routed = Vec::with_capacity(primaries.len());
        let mut escaped = 0;
        for ray in primaries {
            match self.scene.locate(ray.origin, ray.direction, None) {
                Some((domain, _)) => routed.push(ray.with_target(domain)),
                None => {
                    self.film
                        .accumulate(ray.pixel, ray.weight * ray.color * self.scene.background);
                    escaped += 1;
                }
            }
        }
        self.counters.add_completed(escaped);

        let stats = self.route(routed);
        log::debug!(
            "rank {}: generated tile {:?}: {} queued, {} away, {} background",
            self.rank,
            tile,
            stats.queued,
            stats.away,
            escaped
        );
        stats
    }

    /// Start a frame with externally produced primary rays.
    pub fn begin_with(&mut self, primaries: RayBatch) -> FilterStats {
        self.begin_frame();
        self.counters.add_produced(primaries.len() as u64);
        self.route(primaries)
    }

    // Rays from faster ranks may already be queued; they belong to this frame.
    fn begin_frame(&mut self) {
        self.termination.reset();
        self.iterations = 0;
        self.frame_start = Some(Instant::now());
    }

    /// ROUTE rays arriving from another rank.
    pub fn receive(&mut self, rays: RayBatch) -> FilterStats {
        self.counters.add_received(rays.len() as u64);
        self.route(rays)
    }

    fn route(&mut self, rays: RayBatch) -> FilterStats {
        let router = &mut self.router;
        let stats = self.profiler.time(Phase::Filter, || router.filter(rays));
        self.counters.add_dropped(stats.dropped as u64);
        stats
    }

    /// One SELECT, TRACE, SHUFFLE pass followed by SendAway.
    pub fn iterate(&mut self) -> Result<Iteration, TraceError> {
        let mut iteration = Iteration::default();
        self.iterations += 1;

        let selected = {
            let router = &self.router;
            self.profiler.time(Phase::Schedule, || router.select_next())
        };

        if let Some(id) = selected {
            let domain = self.scene.domain(id).ok_or(TraceError::UnknownDomain(id))?;
            let rays = self.router.take(id);
            let count = rays.len();

            // TRACE
            let start = Instant::now();
            let adapter = self.slot.activate(domain)?;
            let mut continuations = Vec::with_capacity(count);
            let terminated = adapter.trace(rays, domain, &mut continuations, &mut self.film)?;
            self.profiler.add(Phase::Adapter, start.elapsed());
            if terminated > count {
                return Err(TraceError::Adapter {
                    domain: id,
                    message: format!("{} of {} rays reported terminated", terminated, count),
                });
            }
            self.counters.add_traced(count as u64);
            self.counters.add_completed(terminated as u64);
            self.counters.add_continued((count - terminated) as u64);

            // SHUFFLE
            self.counters.add_produced(continuations.len() as u64);
            iteration.continuations = continuations.len();
            let start = Instant::now();
            let stats = self.router.filter(continuations);
            self.profiler.add(Phase::Shuffle, start.elapsed());
            self.counters.add_dropped(stats.dropped as u64);

            log::trace!(
                "rank {}: domain {} traced {} -> {} continuations ({} away, {} dropped)",
                self.rank,
                id,
                count,
                iteration.continuations,
                stats.away,
                stats.dropped
            );
            iteration.domain = Some(id);
            iteration.traced = count;
            iteration.dropped = stats.dropped;
        }

        iteration.shipments = self.send_away();
        Ok(iteration)
    }

    /// Drain the away buffer; counts the rays as sent.
    pub fn send_away(&mut self) -> Vec<Shipment> {
        let shipments = self.router.send_away();
        let sent: usize = shipments.iter().map(|s| s.rays.len()).sum();
        self.counters.add_sent(sent as u64);
        shipments
    }

    /// Finish the frame: release the adapter and charge total time.
    ///
    /// Returns the frame's counts; counters and film are reset afterwards.
    pub fn end_frame(&mut self) -> RayCountSnapshot {
        self.slot.release();
        if let Some(start) = self.frame_start.take() {
            self.profiler.add(Phase::Total, start.elapsed());
        }
        self.profiler.end_frame();
        let counts = self.counters.snapshot();
        self.profiler.log_summary(self.rank, &counts);

        self.counters.reset();
        self.film.clear();
        self.router.clear();
        counts
    }

    /// A frame has started and not yet ended.
    pub fn is_running(&self) -> bool {
        self.frame_start.is_some()
    }

    /// No queued or outgoing rays.
    pub fn is_idle(&self) -> bool {
        self.router.is_idle()
    }

    pub fn router(&self) -> &RayRouter {
        &self.router
    }

    pub fn film(&self) -> &Film {
        &self.film
    }

    pub fn counters(&self) -> &Arc<RayCounters> {
        &self.counters
    }

    pub fn profiler_mut(&mut self) -> &mut Profiler {
        &mut self.profiler
    }

    pub fn termination(&self) -> &Termination {
        &self.termination
    }

    pub fn termination_mut(&mut self) -> &mut Termination {
        &mut self.termination
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Background radiance for rays that leave the scene.
    pub fn background(&self) -> Color {
        self.scene.background
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Adapter;
    use strata_core::{Domain, Ray};
    use strata_math::Vec3;

    /// Adapter that turns the first `emit` rays it sees into continuations
    /// for `next`, and terminates everything else.
    struct Scripted {
        next: DomainId,
        emit: usize,
    }

    impl Adapter for Scripted {
        fn trace(&mut self, rays: RayBatch, _domain: &Domain, out: &mut RayBatch, film: &mut Film) -> Result<usize, TraceError> {
            let mut terminated = 0;
            for ray in rays {
                if self.emit > 0 {
                    self.emit -= 1;
                    out.push(ray.with_target(self.next));
                } else {
                    film.accumulate(ray.pixel, Color::ONE);
                    terminated += 1;
                }
            }
            Ok(terminated)
        }
    }

    fn tracer(rank: Rank, ranks: usize, next: DomainId, emit: usize) -> DomainTracer {
        let scene = Arc::new(Scene::grid([2, 1, 1]));
        let ownership = Arc::new(OwnershipTable::round_robin(2, ranks));
        let factory = move |_: &Domain| -> Result<Box<dyn Adapter>, TraceError> { Ok(Box::new(Scripted { next, emit })) };
        DomainTracer::new(rank, scene, ownership, Box::new(factory), 16, 16)
    }

    fn primaries(target: DomainId, n: usize) -> RayBatch {
        (0..n)
            .map(|i| Ray::primary(Vec3::ZERO, Vec3::Z, i as u32, 1.0, 4).with_target(target))
            .collect()
    }

    #[test]
    fn test_single_rank_finishes_in_one_pass() {
        let mut tracer = tracer(0, 1, 1, 0);
        tracer.begin_with(primaries(0, 50));

        let pass = tracer.iterate().unwrap();
        assert_eq!(pass.domain, Some(0));
        assert_eq!(pass.traced, 50);
        assert!(pass.shipments.is_empty());
        assert!(tracer.is_idle());

        let pass = tracer.iterate().unwrap();
        assert!(!pass.did_work());
        assert!(pass.shipments.is_empty());

        let counts = tracer.counters().snapshot();
        assert_eq!(counts.completed, 50);
        assert_eq!(counts.sent, 0);
        assert_eq!(counts.settled(), counts.produced);
    }

    #[test]
    fn test_continuations_ship_to_owner() {
        // 100 primaries on domain 0 (rank 0); 40 continue into domain 1 (rank 1)
        let mut tracer = tracer(0, 2, 1, 40);
        tracer.begin_with(primaries(0, 100));

        let pass = tracer.iterate().unwrap();
        assert_eq!(pass.traced, 100);
        assert_eq!(pass.continuations, 40);
        assert_eq!(pass.shipments.len(), 1);
        assert_eq!(pass.shipments[0].owner, 1);
        assert_eq!(pass.shipments[0].domain, 1);
        assert_eq!(pass.shipped(), 40);
        assert_eq!(tracer.router().pending_away(), 0);

        let counts = tracer.counters().snapshot();
        assert_eq!(counts.produced, 140);
        assert_eq!(counts.sent, 40);
        assert_eq!(counts.completed, 60);
        assert_eq!(counts.continued, 40);
        // The 40 shipped rays settle on rank 1
        assert_eq!(counts.settled() + counts.sent, counts.produced);
    }

    #[test]
    fn test_unknown_domain_dropped_and_counted() {
        let mut tracer = tracer(0, 1, 99, 7);
        tracer.begin_with(primaries(0, 10));

        let pass = tracer.iterate().unwrap();
        assert_eq!(pass.dropped, 7);
        assert!(tracer.is_idle());
        assert_eq!(tracer.counters().snapshot().dropped, 7);
    }

    #[test]
    fn test_received_rays_counted_and_queued() {
        let mut tracer = tracer(1, 2, 0, 0);
        tracer.begin_with(Vec::new());
        let stats = tracer.receive(primaries(1, 40));

        assert_eq!(stats.queued, 40);
        assert_eq!(tracer.router().queue_len(1), 40);
        assert_eq!(tracer.counters().snapshot().received, 40);
    }

    #[test]
    fn test_generate_routes_primaries() {
        let scene = Arc::new(Scene::grid([2, 1, 1]));
        let camera = Camera::for_scene(&scene, 16, 8, 1, 3);
        let mut tracer = tracer(0, 1, 0, 0);

        let stats = tracer.generate(&camera, &Tile::new(0, 0, 16, 8), 3);
        let counts = tracer.counters().snapshot();

        assert_eq!(counts.produced, 16 * 8);
        assert_eq!(stats.queued as u64 + counts.completed, 16 * 8);
        assert!(stats.queued > 0);
        assert!(tracer.is_running());

        let counts = tracer.end_frame();
        assert_eq!(counts.produced, 128);
        assert!(!tracer.is_running());
        assert_eq!(tracer.counters().snapshot().produced, 0);
    }
}
