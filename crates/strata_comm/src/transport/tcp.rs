//! Full-mesh TCP transport.
//!
//! Every pair of ranks shares one connection. Lower ranks listen, higher
//! ranks connect and introduce themselves with their rank id. A reader
//! thread per peer decodes frames into a shared mailbox so `probe` never
//! blocks on a socket.
//!
//! Frame layout: `tag:u32 LE`, `len:u32 LE`, then `len` payload bytes.
//!
//! A rank that shuts down cleanly sends a goodbye frame before closing. Any
//! other end of a connection means the peer died mid-run; the reader files
//! that in the mailbox so the next `probe` fails instead of waiting forever.

use std::collections::VecDeque;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use super::{Envelope, Packet, Transport};
use crate::error::CommError;
use crate::{Rank, Tag};

const FRAME_HEADER_SIZE: usize = 8;
const CONNECT_RETRY: Duration = Duration::from_millis(50);
/// Never handed to the pump; below the pump's reserved system tags.
const GOODBYE_TAG: Tag = u32::MAX - 16;

enum Slot {
    Packet(Packet),
    Lost { peer: Rank, reason: String },
}

type Mailbox = Arc<Mutex<VecDeque<Slot>>>;

/// One rank's end of a TCP mesh.
pub struct TcpTransport {
    rank: Rank,
    size: usize,
    peers: Vec<Option<TcpStream>>,
    mailbox: Mailbox,
    closing: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Join the mesh described by `addrs`, where `addrs[rank]` is this
    /// rank's listen address.
    ///
    /// Blocks until every peer is connected. Fails with
    /// [`CommError::ConnectTimeout`] if a higher rank has not connected by
    /// the time `timeout` elapses.
    pub fn connect(rank: Rank, addrs: &[SocketAddr], timeout: Duration) -> Result<Self, CommError> {
        let size = addrs.len();
        let listen = *addrs.get(rank).ok_or(CommError::InvalidRank { rank, size })?;
        let listener = TcpListener::bind(listen)?;
        log::info!("rank {} listening on {}", rank, listen);

        let mut peers: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();
        let deadline = Instant::now() + timeout;

        // Connect down, accept up
        for (peer, addr) in addrs.iter().enumerate().take(rank) {
            let mut stream = connect_with_retry(*addr, deadline)?;
            stream.write_all(&(rank as u32).to_le_bytes())?;
            log::debug!("rank {} connected to rank {} at {}", rank, peer, addr);
            peers[peer] = Some(stream);
        }
        listener.set_nonblocking(true)?;
        for _ in rank + 1..size {
            let (mut stream, from) = accept_until(&listener, deadline, timeout)?;
            stream.set_nonblocking(false)?;
            stream.set_read_timeout(Some(deadline.saturating_duration_since(Instant::now()).max(CONNECT_RETRY)))?;
            let mut hello = [0u8; 4];
            stream.read_exact(&mut hello)?;
            stream.set_read_timeout(None)?;
            let peer = u32::from_le_bytes(hello) as Rank;
            if peer <= rank || peer >= size || peers[peer].is_some() {
                return Err(CommError::InvalidRank { rank: peer, size });
            }
            log::debug!("rank {} accepted rank {} from {}", rank, peer, from);
            peers[peer] = Some(stream);
        }

        let mailbox: Mailbox = Arc::new(Mutex::new(VecDeque::new()));
        let closing = Arc::new(AtomicBool::new(false));
        for (peer, stream) in peers.iter().enumerate() {
            let Some(stream) = stream else { continue };
            stream.set_nodelay(true)?;
            let reader = stream.try_clone()?;
            let mailbox = Arc::clone(&mailbox);
            let closing = Arc::clone(&closing);
            thread::Builder::new()
                .name(format!("strata-tcp-rx-{}", peer))
                .spawn(move || read_frames(peer, reader, &mailbox, &closing))?;
        }

        log::info!("rank {} joined mesh of {} ranks", rank, size);
        Ok(Self {
            rank,
            size,
            peers,
            mailbox,
            closing,
        })
    }

    fn mailbox(&self) -> MutexGuard<'_, VecDeque<Slot>> {
        lock(&self.mailbox)
    }
}

fn lock(mailbox: &Mailbox) -> MutexGuard<'_, VecDeque<Slot>> {
    mailbox.lock().unwrap_or_else(|e| e.into_inner())
}

/// Next arrival, or the loss of a peer once everything it sent before
/// dying has been consumed.
fn front(mailbox: &VecDeque<Slot>) -> Result<Option<Envelope>, CommError> {
    match mailbox.front() {
        None => Ok(None),
        Some(Slot::Packet(packet)) => Ok(Some(packet.envelope())),
        Some(Slot::Lost { peer, reason }) => Err(CommError::PeerLost {
            peer: *peer,
            reason: reason.clone(),
        }),
    }
}

fn accept_until(listener: &TcpListener, deadline: Instant, timeout: Duration) -> Result<(TcpStream, SocketAddr), CommError> {
    loop {
        match listener.accept() {
            Ok(accepted) => return Ok(accepted),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(CommError::ConnectTimeout(timeout));
                }
                thread::sleep(CONNECT_RETRY);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn connect_with_retry(addr: SocketAddr, deadline: Instant) -> Result<TcpStream, CommError> {
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() < deadline => {
                log::trace!("connect to {} failed ({}), retrying", addr, e);
                thread::sleep(CONNECT_RETRY);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn read_frames<R: Read>(peer: Rank, stream: R, mailbox: &Mailbox, closing: &AtomicBool) {
    let mut reader = BufReader::new(stream);
    let reason = loop {
        match read_frame(&mut reader) {
            Ok((GOODBYE_TAG, _)) => {
                log::debug!("rank {} closed its connection", peer);
                return;
            }
            Ok((tag, payload)) => {
                let packet = Packet {
                    source: peer,
                    tag,
                    payload,
                };
                lock(mailbox).push_back(Slot::Packet(packet));
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break "connection closed without a goodbye".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    // Our own shutdown also ends the read
    if closing.load(Ordering::Acquire) {
        return;
    }
    log::warn!("lost rank {}: {}", peer, reason);
    lock(mailbox).push_back(Slot::Lost { peer, reason });
}

fn read_frame<R: Read>(reader: &mut R) -> io::Result<(Tag, Vec<u8>)> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header)?;
    let tag = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok((tag, payload))
}

fn write_frame<W: Write>(writer: &mut W, tag: Tag, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload exceeds 4 GiB"))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&tag.to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame)
}

impl Transport for TcpTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn probe(&mut self) -> Result<Option<Envelope>, CommError> {
        front(&self.mailbox())
    }

    fn recv(&mut self, envelope: &Envelope, buf: &mut [u8]) -> Result<usize, CommError> {
        let mut mailbox = self.mailbox();
        front(&mailbox)?;
        match mailbox.pop_front() {
            Some(Slot::Packet(packet)) => packet.deliver(envelope, buf),
            _ => Err(CommError::ProbeMismatch {
                tag: envelope.tag,
                peer: envelope.source,
            }),
        }
    }

    fn send(&mut self, dest: Rank, tag: Tag, payload: &[u8]) -> Result<(), CommError> {
        if dest == self.rank {
            self.mailbox().push_back(Slot::Packet(Packet {
                source: self.rank,
                tag,
                payload: payload.to_vec(),
            }));
            return Ok(());
        }
        let size = self.size;
        let stream = self
            .peers
            .get_mut(dest)
            .and_then(Option::as_mut)
            .ok_or(CommError::InvalidRank { rank: dest, size })?;
        write_frame(stream, tag, payload)?;
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);
        for stream in self.peers.iter_mut().flatten() {
            if let Err(e) = write_frame(stream, GOODBYE_TAG, &[]) {
                log::debug!("goodbye to {:?} failed: {}", stream.peer_addr().ok(), e);
            }
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}
