//! Two-thread communication pump.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::collective::{self, Collectives, Frame, ReduceOp, TAG_ABORT, TAG_REDUCE_DOWN, TAG_REDUCE_UP};
use crate::error::{fatal, CommError, WorkError};
use crate::queue::WorkQueue;
use crate::transport::Transport;
use crate::work::{CommType, Registry, Work, WorkKind};
use crate::{Rank, Tag};

/// Pump timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommConfig {
    /// Network thread sleep when there is nothing to send or receive
    pub poll_backoff: Duration,
    /// Longest the execution thread waits for a message after the worker
    /// reports it is idle
    pub exec_wait: Duration,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            poll_backoff: Duration::from_micros(50),
            exec_wait: Duration::from_millis(2),
        }
    }
}

impl CommConfig {
    pub fn with_exec_wait(mut self, exec_wait: Duration) -> Self {
        self.exec_wait = exec_wait;
        self
    }
}

/// Result of one [`Worker::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Made progress; step again as soon as the inbound queue is empty
    Busy,
    /// Nothing to do until a message arrives
    Idle,
}

/// Rank-local state driven by the execution thread.
///
/// The execution thread owns the worker exclusively. Message actions and
/// `step` both receive `&mut self`, so no locking is needed inside.
pub trait Worker: Send + Sized + 'static {
    /// Advance local work by one unit. Called whenever no message is queued.
    fn step(&mut self, comm: &CommHandle<Self>) -> Result<Step, WorkError>;

    /// Called once when an action or step fails, before the executor exits.
    fn failed(&mut self, _err: &WorkError) {}
}

pub(crate) struct Incoming<W> {
    source: Rank,
    tag: Tag,
    work: Box<dyn Work<W>>,
}

pub(crate) enum Outgoing<W> {
    Work {
        tag: Tag,
        comm: CommType,
        dest: Rank,
        payload: Vec<u8>,
        /// Copy for the sender itself, queued inbound after the peers' sends
        local: Option<Box<dyn Work<W>>>,
    },
    System {
        dest: Rank,
        tag: Tag,
        payload: Vec<u8>,
    },
}

pub(crate) enum Arrival<W> {
    Work(Incoming<W>),
    System { source: Rank, tag: Tag, payload: Vec<u8> },
}

struct Shared<W> {
    rank: Rank,
    size: usize,
    config: CommConfig,
    registry: Registry<W>,
    inbound: WorkQueue<Incoming<W>>,
    outbound: WorkQueue<Outgoing<W>>,
    collectives: Collectives,
    stop: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl<W> Shared<W> {
    /// Keep the first failure; later ones are usually its consequences.
    fn record_failure(&self, reason: String) {
        let mut failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
        if failure.is_none() {
            *failure = Some(reason);
        }
    }

    fn halt(&self) {
        self.stop.store(true, Ordering::Release);
        self.collectives.wake();
        self.inbound.notify_all();
    }
}

/// Cloneable access to a running pump: sending, collectives and queue state.
pub struct CommHandle<W> {
    shared: Arc<Shared<W>>,
}

impl<W> Clone for CommHandle<W> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<W: 'static> CommHandle<W> {
    pub fn rank(&self) -> Rank {
        self.shared.rank
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub fn registry(&self) -> &Registry<W> {
        &self.shared.registry
    }

    /// Send a message to one rank.
    ///
    /// A message to this rank goes straight to the inbound queue without
    /// being serialized.
    pub fn send<K: WorkKind<W>>(&self, dest: Rank, work: K) -> Result<(), CommError> {
        let shared = &self.shared;
        if dest >= shared.size {
            return Err(CommError::InvalidRank {
                rank: dest,
                size: shared.size,
            });
        }
        let tag = shared.registry.tag_of::<K>()?;
        if dest == shared.rank {
            log::trace!("rank {} -> self: {}", shared.rank, K::NAME);
            shared.inbound.push(Incoming {
                source: shared.rank,
                tag,
                work: Box::new(work),
            });
            return Ok(());
        }
        shared.outbound.push(Outgoing::Work {
            tag,
            comm: CommType::P2p,
            dest,
            payload: work.serialize(),
            local: None,
        });
        Ok(())
    }

    /// Send a message to every rank, this one included.
    pub fn send_all<K: WorkKind<W>>(&self, work: K) -> Result<(), CommError> {
        let shared = &self.shared;
        let tag = shared.registry.tag_of::<K>()?;
        if shared.size == 1 {
            shared.inbound.push(Incoming {
                source: shared.rank,
                tag,
                work: Box::new(work),
            });
            return Ok(());
        }
        shared.outbound.push(Outgoing::Work {
            tag,
            comm: CommType::BroadcastIncludingSelf,
            dest: shared.rank,
            payload: work.serialize(),
            local: Some(Box::new(work)),
        });
        Ok(())
    }

    /// Send a message to every rank except this one.
    pub fn send_all_other<K: WorkKind<W>>(&self, work: K) -> Result<(), CommError> {
        let shared = &self.shared;
        let tag = shared.registry.tag_of::<K>()?;
        if shared.size > 1 {
            shared.outbound.push(Outgoing::Work {
                tag,
                comm: CommType::BroadcastExcludingSelf,
                dest: shared.rank,
                payload: work.serialize(),
                local: None,
            });
        }
        Ok(())
    }

    /// Element-wise sum over all ranks. Blocks until every rank contributes.
    pub fn all_reduce_sum(&self, values: &[u64]) -> Result<Vec<u64>, CommError> {
        self.all_reduce(values, ReduceOp::Sum)
    }

    /// Element-wise minimum over all ranks.
    pub fn all_reduce_min(&self, values: &[u64]) -> Result<Vec<u64>, CommError> {
        self.all_reduce(values, ReduceOp::Min)
    }

    /// Element-wise maximum over all ranks.
    pub fn all_reduce_max(&self, values: &[u64]) -> Result<Vec<u64>, CommError> {
        self.all_reduce(values, ReduceOp::Max)
    }

    /// Block until every rank reaches the barrier.
    pub fn barrier(&self) -> Result<(), CommError> {
        self.all_reduce(&[], ReduceOp::Sum).map(|_| ())
    }

    fn all_reduce(&self, values: &[u64], op: ReduceOp) -> Result<Vec<u64>, CommError> {
        let shared = &self.shared;
        let seq = shared.collectives.next_seq();
        if shared.size == 1 {
            return Ok(values.to_vec());
        }

        if shared.rank != 0 {
            let frame = Frame {
                seq,
                op,
                values: values.to_vec(),
            };
            shared.outbound.push(Outgoing::System {
                dest: 0,
                tag: TAG_REDUCE_UP,
                payload: frame.encode(),
            });
            return shared.collectives.wait_result(seq, &shared.stop);
        }

        let parts = shared.collectives.wait_gathered(seq, shared.size - 1, &shared.stop)?;
        let mut acc = values.to_vec();
        for part in &parts {
            if part.len() != acc.len() {
                return Err(CommError::CollectiveMismatch {
                    seq,
                    expected: acc.len(),
                    actual: part.len(),
                });
            }
            op.combine(&mut acc, part);
        }
        let payload = Frame {
            seq,
            op,
            values: acc.clone(),
        }
        .encode();
        for dest in 1..shared.size {
            shared.outbound.push(Outgoing::System {
                dest,
                tag: TAG_REDUCE_DOWN,
                payload: payload.clone(),
            });
        }
        Ok(acc)
    }

    /// Messages waiting for the execution thread.
    pub fn inbound_len(&self) -> usize {
        self.shared.inbound.len()
    }

    /// Messages waiting for the network thread.
    pub fn outbound_len(&self) -> usize {
        self.shared.outbound.len()
    }

    /// Whether the pump has been told to stop.
    pub fn is_stopping(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }
}

/// A rank's running communication pump.
pub struct Communicator<W> {
    handle: CommHandle<W>,
    network: Option<JoinHandle<()>>,
    executor: Option<JoinHandle<()>>,
}

impl<W: Worker> Communicator<W> {
    /// Start the pump on `transport`.
    ///
    /// The network thread starts first and every rank's registry fingerprint
    /// is compared before `build` creates the worker and the execution
    /// thread starts. Every rank must call `start`.
    pub fn start<T, F>(transport: T, registry: Registry<W>, config: CommConfig, build: F) -> Result<Self, CommError>
    where
        T: Transport,
        F: FnOnce(&CommHandle<W>) -> W,
    {
        let rank = transport.rank();
        let size = transport.size();
        let shared = Arc::new(Shared {
            rank,
            size,
            config,
            registry,
            inbound: WorkQueue::new(),
            outbound: WorkQueue::new(),
            collectives: Collectives::default(),
            stop: AtomicBool::new(false),
            failure: Mutex::new(None),
        });

        let network = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("strata-net-{}", rank))
                .spawn(move || network_loop(transport, &shared))?
        };
        let mut comm = Self {
            handle: CommHandle { shared },
            network: Some(network),
            executor: None,
        };

        let fingerprint = comm.handle.registry().fingerprint();
        let words = [fingerprint & 0xffff_ffff, fingerprint >> 32];
        let low = comm.handle.all_reduce_min(&words)?;
        let high = comm.handle.all_reduce_max(&words)?;
        if low != high {
            return Err(CommError::RegistryMismatch { local: fingerprint });
        }

        let worker = build(&comm.handle);
        let handle = comm.handle.clone();
        comm.executor = Some(
            thread::Builder::new()
                .name(format!("strata-exec-{}", rank))
                .spawn(move || execute_loop(worker, handle))?,
        );

        log::info!(
            "rank {}/{} communicator started ({} message kinds)",
            rank,
            size,
            comm.handle.registry().len()
        );
        Ok(comm)
    }

    pub fn handle(&self) -> &CommHandle<W> {
        &self.handle
    }

    /// Stop both threads and check that nothing was left behind.
    ///
    /// The network thread flushes the outbound queue before it exits. Any
    /// message still queued afterwards, in either direction, is an error:
    /// it would be lost work.
    pub fn quit(mut self) -> Result<(), CommError> {
        self.stop_threads()?;
        let shared = &self.handle.shared;

        if let Some(message) = shared.failure.lock().unwrap_or_else(|e| e.into_inner()).take() {
            return Err(CommError::WorkerFailed(message));
        }
        let inbound = shared.inbound.len();
        if inbound > 0 {
            return Err(CommError::QueueNotEmpty {
                queue: "inbound",
                len: inbound,
            });
        }
        let outbound = shared.outbound.len();
        if outbound > 0 {
            return Err(CommError::QueueNotEmpty {
                queue: "outbound",
                len: outbound,
            });
        }

        log::info!("rank {} communicator stopped", shared.rank);
        Ok(())
    }

    fn stop_threads(&mut self) -> Result<(), CommError> {
        let shared = &self.handle.shared;
        shared.stop.store(true, Ordering::Release);
        shared.collectives.wake();
        shared.inbound.notify_all();

        if let Some(executor) = self.executor.take() {
            executor.join().map_err(|_| CommError::ThreadPanicked("execution"))?;
        }
        if let Some(network) = self.network.take() {
            network.join().map_err(|_| CommError::ThreadPanicked("network"))?;
        }
        Ok(())
    }
}

impl<W> Drop for Communicator<W> {
    fn drop(&mut self) {
        let shared = &self.handle.shared;
        shared.stop.store(true, Ordering::Release);
        shared.collectives.wake();
        if let Some(executor) = self.executor.take() {
            let _ = executor.join();
        }
        if let Some(network) = self.network.take() {
            let _ = network.join();
        }
    }
}

/// Probe for one message and rebuild it.
///
/// The receive buffer is sized from the probe; a transfer of any other
/// length is a protocol violation.
pub(crate) fn receive_one<W: 'static>(
    transport: &mut dyn Transport,
    registry: &Registry<W>,
) -> Result<Option<Arrival<W>>, CommError> {
    let Some(envelope) = transport.probe()? else {
        return Ok(None);
    };
    let system = collective::is_system_tag(envelope.tag);
    if !system && !registry.contains(envelope.tag) {
        return Err(CommError::UnknownTag {
            tag: envelope.tag,
            peer: envelope.source,
        });
    }

    let mut buf = vec![0u8; envelope.len];
    let received = transport.recv(&envelope, &mut buf)?;
    if received != envelope.len {
        return Err(CommError::LengthMismatch {
            tag: envelope.tag,
            peer: envelope.source,
            advertised: envelope.len,
            received,
        });
    }

    if system {
        return Ok(Some(Arrival::System {
            source: envelope.source,
            tag: envelope.tag,
            payload: buf,
        }));
    }
    let work = registry.decode(envelope.tag, &buf).map_err(|source| CommError::Decode {
        tag: envelope.tag,
        name: registry.name(envelope.tag).unwrap_or("?"),
        source,
    })?;
    Ok(Some(Arrival::Work(Incoming {
        source: envelope.source,
        tag: envelope.tag,
        work,
    })))
}

fn dispatch<W: 'static>(transport: &mut dyn Transport, shared: &Shared<W>, out: Outgoing<W>) -> Result<(), CommError> {
    match out {
        Outgoing::Work {
            tag,
            comm,
            dest,
            payload,
            local,
        } => {
            match comm {
                CommType::P2p => transport.send(dest, tag, &payload)?,
                CommType::BroadcastIncludingSelf | CommType::BroadcastExcludingSelf => {
                    for peer in (0..shared.size).filter(|&p| p != shared.rank) {
                        transport.send(peer, tag, &payload)?;
                    }
                }
            }
            if let Some(work) = local {
                shared.inbound.push(Incoming {
                    source: shared.rank,
                    tag,
                    work,
                });
            }
        }
        Outgoing::System { dest, tag, payload } => transport.send(dest, tag, &payload)?,
    }
    Ok(())
}

fn network_loop<W: 'static, T: Transport>(mut transport: T, shared: &Shared<W>) {
    log::debug!("rank {} network thread running", shared.rank);
    loop {
        let mut busy = false;

        match receive_one(&mut transport, &shared.registry) {
            Ok(Some(Arrival::Work(incoming))) => {
                busy = true;
                log::trace!(
                    "rank {} <- rank {}: {}",
                    shared.rank,
                    incoming.source,
                    shared.registry.name(incoming.tag).unwrap_or("?")
                );
                shared.inbound.push(incoming);
            }
            Ok(Some(Arrival::System { source, tag, payload })) if tag == TAG_ABORT => {
                let reason = String::from_utf8_lossy(&payload);
                log::error!("rank {}: rank {} aborted the run: {}", shared.rank, source, reason);
                shared.record_failure(format!("rank {}: {}", source, reason));
                shared.halt();
            }
            Ok(Some(Arrival::System { tag, payload, .. })) => {
                busy = true;
                match Frame::decode(&payload) {
                    Ok(frame) => shared.collectives.deliver(tag, frame),
                    Err(e) => fatal("collective frame", &e),
                }
            }
            Ok(None) => {}
            Err(e) => fatal(&format!("rank {} receive", shared.rank), &e),
        }

        if let Some(out) = shared.outbound.try_pop() {
            busy = true;
            if let Err(e) = dispatch(&mut transport, shared, out) {
                fatal(&format!("rank {} send", shared.rank), &e);
            }
        }

        if shared.stop.load(Ordering::Acquire) && shared.outbound.is_empty() {
            break;
        }
        if !busy {
            thread::sleep(shared.config.poll_backoff);
        }
    }
    log::debug!("rank {} network thread stopped", shared.rank);
}

fn execute_loop<W: Worker>(mut worker: W, comm: CommHandle<W>) {
    let shared = &comm.shared;
    log::debug!("rank {} execution thread running", shared.rank);

    while !shared.stop.load(Ordering::Acquire) {
        let next = match shared.inbound.try_pop() {
            Some(incoming) => Some(incoming),
            None => match worker.step(&comm) {
                Ok(Step::Busy) => None,
                Ok(Step::Idle) => shared.inbound.pop_timeout(shared.config.exec_wait),
                Err(e) => {
                    fail(&mut worker, shared, "step", e);
                    break;
                }
            },
        };

        if let Some(incoming) = next {
            let name = shared.registry.name(incoming.tag).unwrap_or("?");
            if let Err(e) = incoming.work.action(&mut worker, &comm) {
                fail(&mut worker, shared, name, e);
                break;
            }
        }
    }
    log::debug!("rank {} execution thread stopped", shared.rank);
}

/// Stop this rank after a worker error and tell every peer to stop too.
///
/// Peers may be blocked in a collective or waiting for rays this rank will
/// never send, so a local failure always ends the whole run.
fn fail<W: Worker>(worker: &mut W, shared: &Shared<W>, context: &str, err: WorkError) {
    log::error!("rank {}: {} failed: {}", shared.rank, context, err);
    worker.failed(&err);
    let reason = format!("{}: {}", context, err);

    // Aborts must be queued before `stop` so the network thread flushes them
    if !shared.stop.load(Ordering::Acquire) {
        for dest in (0..shared.size).filter(|&p| p != shared.rank) {
            shared.outbound.push(Outgoing::System {
                dest,
                tag: TAG_ABORT,
                payload: reason.clone().into_bytes(),
            });
        }
    }
    shared.record_failure(reason);
    shared.halt();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Envelope, LocalCluster};
    use std::sync::mpsc;
    use std::time::Instant;

    #[derive(Default)]
    struct Tally {
        total: u64,
        seen: Vec<u64>,
        hold: Option<mpsc::Receiver<()>>,
    }

    impl Worker for Tally {
        fn step(&mut self, _comm: &CommHandle<Self>) -> Result<Step, WorkError> {
            Ok(Step::Idle)
        }
    }

    struct Add(u64);

    impl Work<Tally> for Add {
        fn serialize(&self) -> Vec<u8> {
            self.0.to_le_bytes().to_vec()
        }

        fn action(self: Box<Self>, worker: &mut Tally, _comm: &CommHandle<Tally>) -> Result<(), WorkError> {
            worker.total += self.0;
            worker.seen.push(self.0);
            Ok(())
        }
    }

    impl WorkKind<Tally> for Add {
        const NAME: &'static str = "Add";

        fn deserialize(payload: &[u8]) -> Result<Self, WorkError> {
            let bytes: [u8; 8] = payload.try_into().map_err(|_| WorkError::PayloadSize {
                expected: 8,
                actual: payload.len(),
            })?;
            Ok(Add(u64::from_le_bytes(bytes)))
        }
    }

    /// Replies to the sender with the sum it has seen so far.
    struct Report;

    impl Work<Tally> for Report {
        fn serialize(&self) -> Vec<u8> {
            Vec::new()
        }

        fn action(self: Box<Self>, worker: &mut Tally, comm: &CommHandle<Tally>) -> Result<(), WorkError> {
            comm.send(0, Add(worker.total))?;
            Ok(())
        }
    }

    impl WorkKind<Tally> for Report {
        const NAME: &'static str = "Report";

        fn deserialize(_payload: &[u8]) -> Result<Self, WorkError> {
            Ok(Report)
        }
    }

    /// Blocks the executor until released.
    struct Hold;

    impl Work<Tally> for Hold {
        fn serialize(&self) -> Vec<u8> {
            Vec::new()
        }

        fn action(self: Box<Self>, worker: &mut Tally, _comm: &CommHandle<Tally>) -> Result<(), WorkError> {
            if let Some(rx) = worker.hold.take() {
                let _ = rx.recv_timeout(Duration::from_secs(5));
            }
            Ok(())
        }
    }

    impl WorkKind<Tally> for Hold {
        const NAME: &'static str = "Hold";

        fn deserialize(_payload: &[u8]) -> Result<Self, WorkError> {
            Ok(Hold)
        }
    }

    /// Action that always fails.
    struct Fail;

    impl Work<Tally> for Fail {
        fn serialize(&self) -> Vec<u8> {
            Vec::new()
        }

        fn action(self: Box<Self>, _worker: &mut Tally, _comm: &CommHandle<Tally>) -> Result<(), WorkError> {
            Err(WorkError::Action("boom".into()))
        }
    }

    impl WorkKind<Tally> for Fail {
        const NAME: &'static str = "Fail";

        fn deserialize(_payload: &[u8]) -> Result<Self, WorkError> {
            Ok(Fail)
        }
    }

    fn registry() -> Registry<Tally> {
        let mut registry = Registry::new();
        registry.register::<Add>();
        registry.register::<Report>();
        registry.register::<Hold>();
        registry.register::<Fail>();
        registry
    }

    fn start_cluster(size: usize) -> Vec<Communicator<Tally>> {
        let transports = LocalCluster::new(size);
        thread::scope(|s| {
            let starts: Vec<_> = transports
                .into_iter()
                .map(|t| s.spawn(move || Communicator::start(t, registry(), CommConfig::default(), |_| Tally::default())))
                .collect();
            starts.into_iter().map(|h| h.join().unwrap().unwrap()).collect()
        })
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition never became true");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Transport whose receive reports a different byte count than probed.
    struct ShortRead;

    impl Transport for ShortRead {
        fn rank(&self) -> Rank {
            0
        }

        fn size(&self) -> usize {
            2
        }

        fn probe(&mut self) -> Result<Option<Envelope>, CommError> {
            Ok(Some(Envelope { source: 1, tag: 0, len: 8 }))
        }

        fn recv(&mut self, _envelope: &Envelope, _buf: &mut [u8]) -> Result<usize, CommError> {
            Ok(5)
        }

        fn send(&mut self, _dest: Rank, _tag: Tag, _payload: &[u8]) -> Result<(), CommError> {
            Ok(())
        }
    }

    #[test]
    fn test_length_mismatch_is_reported() {
        let err = receive_one(&mut ShortRead, &registry()).err().unwrap();
        assert!(matches!(
            err,
            CommError::LengthMismatch {
                advertised: 8,
                received: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_tag_is_reported() {
        let mut cluster = LocalCluster::new(2);
        let mut b = cluster.pop().unwrap();
        let mut a = cluster.pop().unwrap();
        a.send(1, 77, &[]).unwrap();

        let err = receive_one(&mut b, &registry()).err().unwrap();
        assert!(matches!(err, CommError::UnknownTag { tag: 77, peer: 0 }));
    }

    #[test]
    fn test_zero_byte_message_decodes() {
        let mut cluster = LocalCluster::new(2);
        let mut b = cluster.pop().unwrap();
        let mut a = cluster.pop().unwrap();
        let tag = registry().tag_of::<Report>().unwrap();
        a.send(1, tag, &[]).unwrap();

        assert!(matches!(receive_one(&mut b, &registry()), Ok(Some(Arrival::Work(_)))));
    }

    #[test]
    fn test_single_rank_send_to_self() {
        let transport = LocalCluster::new(1).remove(0);
        let comm = Communicator::start(transport, registry(), CommConfig::default(), |_| Tally::default()).unwrap();

        comm.handle().send(0, Add(5)).unwrap();
        comm.handle().send_all(Add(6)).unwrap();
        comm.handle().send_all_other(Add(100)).unwrap();
        assert_eq!(comm.handle().all_reduce_sum(&[3]).unwrap(), vec![3]);

        wait_until(|| comm.handle().inbound_len() == 0);
        comm.quit().unwrap();
    }

    #[test]
    fn test_cluster_round_trip_and_collectives() {
        let _ = env_logger::builder().is_test(true).try_init();
        let comms = start_cluster(3);

        // Rank 0 broadcasts to everyone including itself, then asks for reports
        comms[0].handle().send_all(Add(10)).unwrap();
        comms[0].handle().send_all_other(Add(1)).unwrap();
        comms[0].handle().send_all_other(Report).unwrap();

        let sums: Vec<Vec<u64>> = thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|c| {
                    let h = c.handle().clone();
                    s.spawn(move || {
                        let sum = h.all_reduce_sum(&[h.rank() as u64, 1]).unwrap();
                        let max = h.all_reduce_max(&[h.rank() as u64]).unwrap();
                        h.barrier().unwrap();
                        [sum, max].concat()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for s in &sums {
            assert_eq!(s, &vec![3, 3, 2]);
        }

        for comm in &comms {
            wait_until(|| comm.handle().inbound_len() == 0 && comm.handle().outbound_len() == 0);
        }
        thread::scope(|s| {
            for comm in comms {
                s.spawn(move || comm.quit().unwrap());
            }
        });
    }

    #[test]
    fn test_worker_failure_stops_every_rank() {
        let _ = env_logger::builder().is_test(true).try_init();
        let comms = start_cluster(2);

        comms[0].handle().send(1, Fail).unwrap();
        // Rank 1 never joins this barrier; its abort must release rank 0
        let err = comms[0].handle().barrier().unwrap_err();
        assert!(matches!(err, CommError::Stopped));
        assert!(comms[0].handle().is_stopping());

        for comm in comms {
            match comm.quit() {
                Err(CommError::WorkerFailed(reason)) => assert!(reason.contains("boom"), "{}", reason),
                other => panic!("expected a worker failure, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_quit_reports_unprocessed_messages() {
        let (release, hold) = mpsc::channel();
        let transport = LocalCluster::new(1).remove(0);
        let comm = Communicator::start(transport, registry(), CommConfig::default(), |_| Tally {
            hold: Some(hold),
            ..Tally::default()
        })
        .unwrap();

        comm.handle().send(0, Hold).unwrap();
        wait_until(|| comm.handle().inbound_len() == 0);
        comm.handle().send(0, Add(1)).unwrap();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let _ = release.send(());
        });
        let err = comm.quit().unwrap_err();
        releaser.join().unwrap();

        assert!(matches!(err, CommError::QueueNotEmpty { queue: "inbound", len: 1 }));
    }

    #[test]
    fn test_registry_mismatch_detected() {
        let transports = LocalCluster::new(2);
        let results: Vec<_> = thread::scope(|s| {
            let starts: Vec<_> = transports
                .into_iter()
                .map(|t| {
                    s.spawn(move || {
                        let mut registry = Registry::new();
                        if t.rank() == 0 {
                            registry.register::<Add>();
                        }
                        registry.register::<Report>();
                        Communicator::start(t, registry, CommConfig::default(), |_| Tally::default()).err()
                    })
                })
                .collect();
            starts.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for err in results {
            assert!(matches!(err, Some(CommError::RegistryMismatch { .. })));
        }
    }
}
