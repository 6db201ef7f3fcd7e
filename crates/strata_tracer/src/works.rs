//! Message kinds exchanged between ranks.
//!
//! Each kind owns its payload layout (little-endian throughout) and hands
//! its action to the matching `RankContext` handler. Registration order in
//! [`registry`] defines the tags and must not change between ranks.

use strata_comm::{CommHandle, Registry, Work, WorkError, WorkKind};
use strata_core::{decode_batch, encode_batch, DomainId, RayBatch, Tile, WireError};

use crate::node::RankContext;

fn invalid(err: WireError) -> WorkError {
    WorkError::Invalid(err.to_string())
}

fn expect_len(payload: &[u8], expected: usize) -> Result<(), WorkError> {
    if payload.len() != expected {
        return Err(WorkError::PayloadSize {
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(b)
}

/// Start a frame on the receiving rank with its share of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileWork {
    pub tile: Tile,
}

impl Work<RankContext> for TileWork {
    fn serialize(&self) -> Vec<u8> {
        self.tile.encode()
    }

    fn action(self: Box<Self>, ctx: &mut RankContext, _comm: &CommHandle<RankContext>) -> Result<(), WorkError> {
        Ok(ctx.on_tile(self.tile)?)
    }
}

impl WorkKind<RankContext> for TileWork {
    const NAME: &'static str = "TileWork";

    fn deserialize(payload: &[u8]) -> Result<Self, WorkError> {
        Ok(Self {
            tile: Tile::decode(payload).map_err(invalid)?,
        })
    }
}

/// A batch of rays for a domain the receiver owns.
#[derive(Debug, Clone, PartialEq)]
pub struct RayWork {
    pub domain: DomainId,
    pub rays: RayBatch,
}

impl Work<RankContext> for RayWork {
    fn serialize(&self) -> Vec<u8> {
        encode_batch(self.domain, &self.rays)
    }

    fn action(self: Box<Self>, ctx: &mut RankContext, _comm: &CommHandle<RankContext>) -> Result<(), WorkError> {
        ctx.on_rays(self.domain, self.rays);
        Ok(())
    }
}

impl WorkKind<RankContext> for RayWork {
    const NAME: &'static str = "RayWork";

    fn deserialize(payload: &[u8]) -> Result<Self, WorkError> {
        let (domain, rays) = decode_batch(payload).map_err(invalid)?;
        Ok(Self { domain, rays })
    }
}

/// Rank 0's probe: "are you still idle?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoneTestWork;

impl Work<RankContext> for DoneTestWork {
    fn serialize(&self) -> Vec<u8> {
        Vec::new()
    }

    fn action(self: Box<Self>, ctx: &mut RankContext, comm: &CommHandle<RankContext>) -> Result<(), WorkError> {
        Ok(ctx.on_done_test(comm)?)
    }
}

impl WorkKind<RankContext> for DoneTestWork {
    const NAME: &'static str = "DoneTestWork";

    fn deserialize(payload: &[u8]) -> Result<Self, WorkError> {
        expect_len(payload, 0)?;
        Ok(Self)
    }
}

/// One rank's answer to a done test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoneReplyWork {
    pub idle: bool,
    pub sent: u64,
    pub received: u64,
}

impl Work<RankContext> for DoneReplyWork {
    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(17);
        out.push(u8::from(self.idle));
        out.extend_from_slice(&self.sent.to_le_bytes());
        out.extend_from_slice(&self.received.to_le_bytes());
        out
    }

    fn action(self: Box<Self>, ctx: &mut RankContext, comm: &CommHandle<RankContext>) -> Result<(), WorkError> {
        Ok(ctx.on_done_reply(*self, comm)?)
    }
}

impl WorkKind<RankContext> for DoneReplyWork {
    const NAME: &'static str = "DoneReplyWork";

    fn deserialize(payload: &[u8]) -> Result<Self, WorkError> {
        expect_len(payload, 17)?;
        Ok(Self {
            idle: payload[0] != 0,
            sent: read_u64(payload, 1),
            received: read_u64(payload, 9),
        })
    }
}

/// Rank 0's done-test verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoneVerdictWork {
    pub done: bool,
}

impl Work<RankContext> for DoneVerdictWork {
    fn serialize(&self) -> Vec<u8> {
        vec![u8::from(self.done)]
    }

    fn action(self: Box<Self>, ctx: &mut RankContext, comm: &CommHandle<RankContext>) -> Result<(), WorkError> {
        Ok(ctx.on_done_verdict(self.done, comm)?)
    }
}

impl WorkKind<RankContext> for DoneVerdictWork {
    const NAME: &'static str = "DoneVerdictWork";

    fn deserialize(payload: &[u8]) -> Result<Self, WorkError> {
        expect_len(payload, 1)?;
        Ok(Self { done: payload[0] != 0 })
    }
}

/// Phase of a two-phase vote message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteKind {
    Propose,
    VoteCommit,
    VoteAbort,
    Commit,
}

impl VoteKind {
    fn to_wire(self) -> u8 {
        match self {
            VoteKind::Propose => 0,
            VoteKind::VoteCommit => 1,
            VoteKind::VoteAbort => 2,
            VoteKind::Commit => 3,
        }
    }

    fn from_wire(v: u8) -> Result<Self, WorkError> {
        match v {
            0 => Ok(VoteKind::Propose),
            1 => Ok(VoteKind::VoteCommit),
            2 => Ok(VoteKind::VoteAbort),
            3 => Ok(VoteKind::Commit),
            other => Err(WorkError::Invalid(format!("unknown vote kind {}", other))),
        }
    }
}

const VOTE_WIRE_SIZE: usize = 29;

/// Two-phase vote traffic for the free-running scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteWork {
    pub kind: VoteKind,
    pub round: u64,
    pub frame: u32,
    pub sent: u64,
    pub received: u64,
}

impl VoteWork {
    pub fn propose(round: u64, frame: u32) -> Self {
        Self {
            kind: VoteKind::Propose,
            round,
            frame,
            sent: 0,
            received: 0,
        }
    }

    pub fn ballot(commit: bool, round: u64, frame: u32, sent: u64, received: u64) -> Self {
        Self {
            kind: if commit { VoteKind::VoteCommit } else { VoteKind::VoteAbort },
            round,
            frame,
            sent,
            received,
        }
    }

    pub fn commit(frame: u32) -> Self {
        Self {
            kind: VoteKind::Commit,
            round: 0,
            frame,
            sent: 0,
            received: 0,
        }
    }
}

impl Work<RankContext> for VoteWork {
    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(VOTE_WIRE_SIZE);
        out.push(self.kind.to_wire());
        out.extend_from_slice(&self.round.to_le_bytes());
        out.extend_from_slice(&self.frame.to_le_bytes());
        out.extend_from_slice(&self.sent.to_le_bytes());
        out.extend_from_slice(&self.received.to_le_bytes());
        out
    }

    fn action(self: Box<Self>, ctx: &mut RankContext, comm: &CommHandle<RankContext>) -> Result<(), WorkError> {
        Ok(ctx.on_vote(*self, comm)?)
    }
}

impl WorkKind<RankContext> for VoteWork {
    const NAME: &'static str = "VoteWork";

    fn deserialize(payload: &[u8]) -> Result<Self, WorkError> {
        expect_len(payload, VOTE_WIRE_SIZE)?;
        Ok(Self {
            kind: VoteKind::from_wire(payload[0])?,
            round: read_u64(payload, 1),
            frame: read_u32(payload, 9),
            sent: read_u64(payload, 13),
            received: read_u64(payload, 21),
        })
    }
}

/// Rank 0 asks every rank for its film.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelGatherWork;

impl Work<RankContext> for PixelGatherWork {
    fn serialize(&self) -> Vec<u8> {
        Vec::new()
    }

    fn action(self: Box<Self>, ctx: &mut RankContext, comm: &CommHandle<RankContext>) -> Result<(), WorkError> {
        Ok(ctx.on_pixel_gather(comm)?)
    }
}

impl WorkKind<RankContext> for PixelGatherWork {
    const NAME: &'static str = "PixelGatherWork";

    fn deserialize(payload: &[u8]) -> Result<Self, WorkError> {
        expect_len(payload, 0)?;
        Ok(Self)
    }
}

/// One rank's non-black film records, as packed by `Film::encode_contributions`.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelWork {
    pub bytes: Vec<u8>,
}

impl Work<RankContext> for PixelWork {
    fn serialize(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    fn action(self: Box<Self>, ctx: &mut RankContext, comm: &CommHandle<RankContext>) -> Result<(), WorkError> {
        Ok(ctx.on_pixels(&self.bytes, comm)?)
    }
}

impl WorkKind<RankContext> for PixelWork {
    const NAME: &'static str = "PixelWork";

    fn deserialize(payload: &[u8]) -> Result<Self, WorkError> {
        strata_core::Film::decode_contributions(payload).map_err(invalid)?;
        Ok(Self {
            bytes: payload.to_vec(),
        })
    }
}

/// The composited frame has been delivered; reset for the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDoneWork;

impl Work<RankContext> for FrameDoneWork {
    fn serialize(&self) -> Vec<u8> {
        Vec::new()
    }

    fn action(self: Box<Self>, ctx: &mut RankContext, _comm: &CommHandle<RankContext>) -> Result<(), WorkError> {
        ctx.on_frame_done();
        Ok(())
    }
}

impl WorkKind<RankContext> for FrameDoneWork {
    const NAME: &'static str = "FrameDoneWork";

    fn deserialize(payload: &[u8]) -> Result<Self, WorkError> {
        expect_len(payload, 0)?;
        Ok(Self)
    }
}

/// Registry of every message kind, in wire-tag order.
pub fn registry() -> Registry<RankContext> {
    let mut registry = Registry::new();
    registry.register::<TileWork>();
    registry.register::<RayWork>();
    registry.register::<DoneTestWork>();
    registry.register::<DoneReplyWork>();
    registry.register::<DoneVerdictWork>();
    registry.register::<VoteWork>();
    registry.register::<PixelGatherWork>();
    registry.register::<PixelWork>();
    registry.register::<FrameDoneWork>();
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::Ray;
    use strata_math::Vec3;

    fn rebuild<K: WorkKind<RankContext>>(work: &K) -> K {
        K::deserialize(&work.serialize()).unwrap()
    }

    #[test]
    fn test_registry_order_is_stable() {
        let registry = registry();
        assert_eq!(registry.len(), 9);
        assert_eq!(registry.tag_of::<TileWork>().unwrap(), 0);
        assert_eq!(registry.tag_of::<FrameDoneWork>().unwrap(), 8);
        assert_eq!(registry.fingerprint(), super::registry().fingerprint());
    }

    #[test]
    fn test_tile_payload_is_sixteen_bytes() {
        let work = TileWork {
            tile: Tile::new(0, 8, 64, 8),
        };
        assert_eq!(work.serialize().len(), 16);
        assert_eq!(rebuild(&work), work);
        assert!(TileWork::deserialize(&[0; 12]).is_err());
    }

    #[test]
    fn test_ray_work_keeps_target() {
        let rays = vec![Ray::primary(Vec3::ZERO, Vec3::X, 3, 0.5, 2).with_target(4); 3];
        let work = RayWork { domain: 4, rays };
        let back = rebuild(&work);
        assert_eq!(back.domain, 4);
        assert_eq!(back.rays.len(), 3);
        assert!(back.rays.iter().all(|r| r.target == 4));
    }

    #[test]
    fn test_vote_layout() {
        let work = VoteWork::ballot(true, 7, 2, 100, 99);
        let bytes = work.serialize();
        assert_eq!(bytes.len(), VOTE_WIRE_SIZE);
        assert_eq!(bytes[0], 1);
        assert_eq!(rebuild(&work), work);

        let mut bad = bytes.clone();
        bad[0] = 9;
        assert!(VoteWork::deserialize(&bad).is_err());
    }

    #[test]
    fn test_control_messages_reject_extra_bytes() {
        assert!(DoneTestWork::deserialize(&[]).is_ok());
        assert!(DoneTestWork::deserialize(&[1]).is_err());
        assert!(FrameDoneWork::deserialize(&[0, 0]).is_err());
        assert!(DoneVerdictWork::deserialize(&[]).is_err());

        let reply = DoneReplyWork {
            idle: true,
            sent: 5,
            received: 5,
        };
        assert_eq!(rebuild(&reply), reply);
    }

    #[test]
    fn test_pixel_work_validates_records() {
        assert!(PixelWork::deserialize(&[0; 16]).is_ok());
        assert!(PixelWork::deserialize(&[0; 15]).is_err());
    }
}
