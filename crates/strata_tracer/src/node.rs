//! Per-rank runtime.
//!
//! `RankContext` is the worker the communication pump drives: message
//! actions land in its `on_*` handlers and `step` runs one tracer pass plus
//! the termination step for the configured scheduler. `Node` wires a
//! context to a transport and runs every frame of a render.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use strata_comm::{fatal, CommConfig, CommError, CommHandle, Communicator, LocalCluster, Step, Transport, WorkError, Worker};
use strata_core::{DomainId, Film, OwnershipTable, Rank, RayBatch, RenderOptions, Scene, SchedulerMode, Tile};

use crate::adapter::AdapterFactory;
use crate::camera::Camera;
use crate::counters::RayCountSnapshot;
use crate::error::TraceError;
use crate::profiler::Phase;
use crate::router::Shipment;
use crate::termination::{DoneTest, TermState, Tally};
use crate::tracer::DomainTracer;
use crate::voter::{Decision, Voter};
use crate::works::{
    self, DoneReplyWork, DoneTestWork, DoneVerdictWork, FrameDoneWork, PixelGatherWork, PixelWork, RayWork, TileWork,
    VoteKind, VoteWork,
};

/// Called on rank 0 with each composited frame.
pub type FrameCallback = Box<dyn FnMut(u32, &Film) + Send>;

const WAIT_SLICE: Duration = Duration::from_millis(100);

/// One rank's numbers for a finished frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame: u32,
    pub counts: RayCountSnapshot,
    pub iterations: u64,
}

/// Everything a rank reports once its render is over.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub rank: Rank,
    pub frames: Vec<FrameReport>,
}

#[derive(Default)]
struct SignalState {
    completed: u32,
    reports: Vec<FrameReport>,
    failure: Option<String>,
}

/// Frame completion hand-off from the execution thread to the rank's
/// main thread.
#[derive(Default)]
pub struct FrameSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl FrameSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn complete(&self, report: FrameReport) {
        let mut state = self.lock();
        state.completed += 1;
        state.reports.push(report);
        self.cond.notify_all();
    }

    pub fn fail(&self, message: String) {
        self.lock().failure = Some(message);
        self.cond.notify_all();
    }

    pub fn completed(&self) -> u32 {
        self.lock().completed
    }

    /// Block until `frames` frames have completed on this rank.
    ///
    /// Returns early with an error if the worker failed or `stopping`
    /// reports that the pump is shutting down.
    pub fn wait_for(&self, frames: u32, stopping: impl Fn() -> bool) -> Result<(), TraceError> {
        let mut state = self.lock();
        loop {
            if let Some(message) = &state.failure {
                return Err(TraceError::RankFailed(message.clone()));
            }
            if state.completed >= frames {
                return Ok(());
            }
            if stopping() {
                return Err(TraceError::RankFailed("communicator stopped before the frame finished".into()));
            }
            state = match self.cond.wait_timeout(state, WAIT_SLICE) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub fn take_reports(&self) -> Vec<FrameReport> {
        std::mem::take(&mut self.lock().reports)
    }
}

/// Rank 0's composite of every rank's film.
struct Gather {
    film: Film,
    replies: usize,
    started: Instant,
}

/// Rank-local state owned by the execution thread.
pub struct RankContext {
    rank: Rank,
    size: usize,
    mode: SchedulerMode,
    seed: u64,
    width: u32,
    height: u32,
    frame: u32,
    camera: Camera,
    tracer: DomainTracer,
    voter: Voter,
    done_test: Option<DoneTest>,
    gather: Option<Gather>,
    callback: Option<FrameCallback>,
    signal: Arc<FrameSignal>,
}

impl RankContext {
    fn new(rank: Rank, size: usize, parts: NodeParts, signal: Arc<FrameSignal>) -> Self {
        let NodeParts {
            options,
            scene,
            ownership,
            factory,
            callback,
        } = parts;
        let camera = Camera::for_scene(
            &scene,
            options.width,
            options.height,
            options.samples_per_pixel,
            options.max_depth,
        );
        let tracer = DomainTracer::new(rank, scene, ownership, factory, options.width, options.height);

        Self {
            rank,
            size,
            mode: options.scheduler,
            seed: options.seed,
            width: options.width,
            height: options.height,
            frame: 0,
            camera,
            tracer,
            voter: Voter::new(size, Duration::from_millis(options.idle_wait_ms)),
            done_test: None,
            gather: None,
            callback,
            signal,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn tracer(&self) -> &DomainTracer {
        &self.tracer
    }

    /// Running with nothing queued locally or in the inbound queue.
    fn is_quiet(&self, comm: &CommHandle<Self>) -> bool {
        self.tracer.is_running() && self.tracer.is_idle() && comm.inbound_len() == 0
    }

    pub(crate) fn on_tile(&mut self, tile: Tile) -> Result<(), TraceError> {
        if self.tracer.is_running() {
            return Err(TraceError::Protocol(format!(
                "rank {}: tile {:?} arrived while frame {} is running",
                self.rank, tile, self.frame
            )));
        }
        self.voter.reset();
        self.done_test = None;
        self.gather = None;

        let seed = self.seed.wrapping_add(u64::from(self.frame) << 32);
        let stats = self.tracer.generate(&self.camera, &tile, seed);
        log::debug!(
            "rank {}: frame {} started with {} primaries queued, {} away",
            self.rank,
            self.frame,
            stats.queued,
            stats.away
        );
        Ok(())
    }

    pub(crate) fn on_rays(&mut self, domain: DomainId, rays: RayBatch) {
        log::trace!("rank {}: received {} rays for domain {}", self.rank, rays.len(), domain);
        self.tracer.receive(rays);
    }

    fn ship(&mut self, shipments: Vec<Shipment>, comm: &CommHandle<Self>) -> Result<(), TraceError> {
        if shipments.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        for Shipment { owner, domain, rays } in shipments {
            log::trace!("rank {}: sending {} rays for domain {} to rank {}", self.rank, rays.len(), domain, owner);
            comm.send(owner, RayWork { domain, rays })?;
        }
        self.tracer.profiler_mut().add(Phase::Send, start.elapsed());
        Ok(())
    }

    /// Lockstep ray tally; every running rank calls this once per pass.
    fn tally(&mut self, comm: &CommHandle<Self>) -> Result<(), TraceError> {
        let start = Instant::now();
        let counts = self.tracer.counters().snapshot();
        let contribution = Tally::contribution(self.tracer.is_idle(), &counts);
        let reduced = comm.all_reduce_sum(&contribution)?;
        let tally = Tally::from_reduced(&reduced).ok_or_else(|| {
            CommError::CollectiveFrame(format!("ray tally returned {} values", reduced.len()))
        })?;
        let state = self.tracer.termination_mut().apply_tally(&tally);
        self.tracer.profiler_mut().add(Phase::Vote, start.elapsed());

        if state == TermState::Testing && self.rank == 0 {
            self.done_test = Some(DoneTest::new(self.size));
            comm.send_all(DoneTestWork)?;
        }
        Ok(())
    }

    pub(crate) fn on_done_test(&mut self, comm: &CommHandle<Self>) -> Result<(), TraceError> {
        let counts = self.tracer.counters().snapshot();
        let reply = DoneReplyWork {
            idle: self.is_quiet(comm),
            sent: counts.sent,
            received: counts.received,
        };
        comm.send(0, reply)?;
        Ok(())
    }

    pub(crate) fn on_done_reply(&mut self, reply: DoneReplyWork, comm: &CommHandle<Self>) -> Result<(), TraceError> {
        let Some(test) = self.done_test.as_mut() else {
            return Err(TraceError::Protocol(format!("rank {}: done reply without a done test", self.rank)));
        };
        if let Some(done) = test.record(reply.idle, reply.sent, reply.received) {
            self.done_test = None;
            log::debug!("rank {}: done test for frame {} -> {}", self.rank, self.frame, done);
            comm.send_all(DoneVerdictWork { done })?;
        }
        Ok(())
    }

    pub(crate) fn on_done_verdict(&mut self, done: bool, comm: &CommHandle<Self>) -> Result<(), TraceError> {
        if self.tracer.termination_mut().apply_verdict(done) == TermState::Done {
            self.on_terminated(comm)?;
        }
        Ok(())
    }

    /// Rank 0: start a vote if nothing is left to do locally.
    fn maybe_propose(&mut self, comm: &CommHandle<Self>) -> Result<(), TraceError> {
        if self.rank != 0 || !self.is_quiet(comm) || !self.voter.propose_available(Instant::now()) {
            return Ok(());
        }
        self.start_round(comm)
    }

    fn start_round(&mut self, comm: &CommHandle<Self>) -> Result<(), TraceError> {
        let start = Instant::now();
        loop {
            let round = self.voter.propose();
            comm.send_all_other(VoteWork::propose(round, self.frame))?;

            let decision = if self.is_quiet(comm) {
                let counts = self.tracer.counters().snapshot();
                self.voter.vote_commit(round, counts.sent, counts.received)
            } else {
                self.voter.vote_abort(round)
            };
            if !self.decide(decision, comm)? {
                break;
            }
        }
        self.tracer.profiler_mut().add(Phase::Vote, start.elapsed());
        Ok(())
    }

    /// Act on a vote decision. Returns true when a confirming round must
    /// be proposed.
    fn decide(&mut self, decision: Decision, comm: &CommHandle<Self>) -> Result<bool, TraceError> {
        match decision {
            Decision::Pending => Ok(false),
            Decision::Confirm => Ok(true),
            Decision::Abort => {
                self.voter.abort(Instant::now());
                Ok(false)
            }
            Decision::Commit => {
                self.voter.commit();
                self.tracer.termination_mut().commit();
                comm.send_all_other(VoteWork::commit(self.frame))?;
                self.on_terminated(comm)?;
                Ok(false)
            }
        }
    }

    pub(crate) fn on_vote(&mut self, vote: VoteWork, comm: &CommHandle<Self>) -> Result<(), TraceError> {
        match vote.kind {
            VoteKind::Propose => {
                let commit = vote.frame == self.frame && !self.tracer.termination().is_done() && self.is_quiet(comm);
                let counts = self.tracer.counters().snapshot();
                comm.send(0, VoteWork::ballot(commit, vote.round, vote.frame, counts.sent, counts.received))?;
            }
            VoteKind::VoteCommit | VoteKind::VoteAbort => {
                if self.rank != 0 || vote.frame != self.frame {
                    log::debug!("rank {}: ignoring ballot for frame {}", self.rank, vote.frame);
                    return Ok(());
                }
                let decision = match vote.kind {
                    VoteKind::VoteCommit => self.voter.vote_commit(vote.round, vote.sent, vote.received),
                    _ => self.voter.vote_abort(vote.round),
                };
                if self.decide(decision, comm)? {
                    self.start_round(comm)?;
                }
            }
            VoteKind::Commit => {
                if vote.frame == self.frame && self.tracer.is_running() {
                    self.tracer.termination_mut().commit();
                }
            }
        }
        Ok(())
    }

    /// The frame is globally done; rank 0 starts gathering pixels.
    fn on_terminated(&mut self, comm: &CommHandle<Self>) -> Result<(), TraceError> {
        log::debug!(
            "rank {}: frame {} terminated after {} iterations",
            self.rank,
            self.frame,
            self.tracer.iterations()
        );
        if self.rank != 0 || self.gather.is_some() {
            return Ok(());
        }
        self.gather = Some(Gather {
            film: Film::new(self.width, self.height),
            replies: 0,
            started: Instant::now(),
        });
        comm.send_all(PixelGatherWork)?;
        Ok(())
    }

    pub(crate) fn on_pixel_gather(&mut self, comm: &CommHandle<Self>) -> Result<(), TraceError> {
        let bytes = self.tracer.film().encode_contributions();
        comm.send(0, PixelWork { bytes })?;
        Ok(())
    }

    pub(crate) fn on_pixels(&mut self, bytes: &[u8], comm: &CommHandle<Self>) -> Result<(), TraceError> {
        let records = Film::decode_contributions(bytes)?;
        let Some(gather) = self.gather.as_mut() else {
            return Err(TraceError::Protocol(format!("rank {}: pixels arrived without a gather", self.rank)));
        };
        for (pixel, color) in records {
            gather.film.accumulate(pixel, color);
        }
        gather.replies += 1;
        if gather.replies < self.size {
            return Ok(());
        }

        if let Some(callback) = self.callback.as_mut() {
            callback(self.frame, &gather.film);
        }
        let elapsed = gather.started.elapsed();
        self.tracer.profiler_mut().add(Phase::Composite, elapsed);
        log::info!("frame {} composited from {} ranks in {:?}", self.frame, self.size, elapsed);
        comm.send_all(FrameDoneWork)?;
        Ok(())
    }

    pub(crate) fn on_frame_done(&mut self) {
        let iterations = self.tracer.iterations();
        let counts = self.tracer.end_frame();
        log::debug!(
            "rank {}: frame {} finished ({} traced, {} sent, {} received, {} dropped)",
            self.rank,
            self.frame,
            counts.traced,
            counts.sent,
            counts.received,
            counts.dropped
        );
        let report = FrameReport {
            frame: self.frame,
            counts,
            iterations,
        };
        self.frame += 1;
        self.signal.complete(report);
    }
}

impl Worker for RankContext {
    fn step(&mut self, comm: &CommHandle<Self>) -> Result<Step, WorkError> {
        if !self.tracer.is_running() || self.tracer.termination().state() != TermState::Active {
            return Ok(Step::Idle);
        }

        let iteration = self.tracer.iterate()?;
        let worked = iteration.did_work() || !iteration.shipments.is_empty();
        self.ship(iteration.shipments, comm)?;

        match self.mode {
            SchedulerMode::SyncDomain => self.tally(comm)?,
            SchedulerMode::AsyncDomain if !worked => self.maybe_propose(comm)?,
            SchedulerMode::AsyncDomain => {}
        }
        Ok(if worked { Step::Busy } else { Step::Idle })
    }

    fn failed(&mut self, err: &WorkError) {
        self.signal.fail(format!("rank {}: {}", self.rank, err));
    }
}

struct NodeParts {
    options: RenderOptions,
    scene: Arc<Scene>,
    ownership: Arc<OwnershipTable>,
    factory: Box<dyn AdapterFactory>,
    callback: Option<FrameCallback>,
}

/// One rank of a distributed render.
pub struct Node {
    parts: NodeParts,
    comm_config: CommConfig,
}

impl Node {
    /// Create a node. Every rank must use the same options, scene and
    /// ownership table.
    pub fn new(
        options: RenderOptions,
        scene: Arc<Scene>,
        ownership: Arc<OwnershipTable>,
        factory: Box<dyn AdapterFactory>,
    ) -> Self {
        let comm_config = CommConfig::default().with_exec_wait(Duration::from_millis(options.idle_wait_ms.max(1)));
        Self {
            parts: NodeParts {
                options,
                scene,
                ownership,
                factory,
                callback: None,
            },
            comm_config,
        }
    }

    /// Override pump timing.
    pub fn with_comm_config(mut self, config: CommConfig) -> Self {
        self.comm_config = config;
        self
    }

    /// Set the frame callback. Only rank 0 ever calls it.
    pub fn on_frame(mut self, callback: impl FnMut(u32, &Film) + Send + 'static) -> Self {
        self.parts.callback = Some(Box::new(callback));
        self
    }

    /// Render every frame on `transport`, then shut the pump down.
    ///
    /// Rank 0 hands out one tile per rank at the start of each frame. All
    /// ranks meet at a barrier after each frame so no rank starts the next
    /// frame while another still holds the previous one's state.
    pub fn run<T: Transport>(self, transport: T) -> Result<NodeReport, TraceError> {
        let rank = transport.rank();
        let size = transport.size();
        let options = &self.parts.options;
        let (width, height, frames) = (options.width, options.height, options.num_frames);
        log::info!(
            "rank {}/{}: rendering {} frame(s) at {}x{} ({:?})",
            rank,
            size,
            frames,
            width,
            height,
            options.scheduler
        );

        let signal = Arc::new(FrameSignal::new());
        let comm = {
            let signal = Arc::clone(&signal);
            let parts = self.parts;
            Communicator::start(transport, works::registry(), self.comm_config, move |handle| {
                RankContext::new(handle.rank(), handle.size(), parts, signal)
            })?
        };
        let handle = comm.handle().clone();

        if let Err(err) = render_frames(&handle, &signal, (width, height), frames) {
            // A failed pump knows the root cause; the local error is its echo
            return Err(match comm.quit() {
                Err(CommError::WorkerFailed(reason)) => TraceError::RankFailed(reason),
                _ => err,
            });
        }

        let reports = signal.take_reports();
        match comm.quit() {
            Ok(()) => {}
            Err(err @ CommError::QueueNotEmpty { .. }) => fatal(&format!("rank {} shutdown", rank), &err),
            Err(err) => return Err(err.into()),
        }
        Ok(NodeReport { rank, frames: reports })
    }
}

fn render_frames(
    handle: &CommHandle<RankContext>,
    signal: &FrameSignal,
    (width, height): (u32, u32),
    frames: u32,
) -> Result<(), TraceError> {
    for frame in 0..frames {
        if handle.rank() == 0 {
            for (dest, tile) in Tile::partition_rows(width, height, handle.size()).into_iter().enumerate() {
                handle.send(dest, TileWork { tile })?;
            }
        }
        signal.wait_for(frame + 1, || handle.is_stopping())?;
        handle.barrier()?;
    }
    Ok(())
}

/// Run `size` ranks in this process over a [`LocalCluster`], one thread each.
///
/// `make_node` builds each rank's node. Returns the reports in rank order,
/// or the first rank error.
pub fn run_local_cluster<F>(size: usize, make_node: F) -> Result<Vec<NodeReport>, TraceError>
where
    F: Fn(Rank) -> Node,
{
    let transports = LocalCluster::new(size);
    thread::scope(|scope| {
        let mut ranks = Vec::with_capacity(size);
        for (rank, transport) in transports.into_iter().enumerate() {
            let node = make_node(rank);
            let handle = thread::Builder::new()
                .name(format!("strata-rank-{}", rank))
                .spawn_scoped(scope, move || node.run(transport))
                .map_err(CommError::from)?;
            ranks.push(handle);
        }

        ranks
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| TraceError::RankFailed("rank thread panicked".into()))?
            })
            .collect()
    })
}
