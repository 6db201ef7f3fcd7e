//! Routable ray type.
//!
//! A ray carries its geometry, the radiance weight it still contributes to
//! its pixel, its remaining bounce budget and exactly one target domain.
//! The core never looks at the geometry; it only routes by `target`.
//!
//! Rays travel between ranks in batches: an 8-byte batch header
//! (`domain:u32`, `count:u32`) followed by `count` fixed-size records.
//! Records use the host byte order; all ranks of a run are assumed to share it.

use bytemuck::{Pod, Zeroable};
use strata_math::Vec3;

use crate::error::WireError;

/// Identifier of a domain (mesh instance).
pub type DomainId = u32;

/// A batch of rays owned by exactly one holder at a time.
pub type RayBatch = Vec<Ray>;

/// Size in bytes of one packed ray record.
pub const RAY_RECORD_SIZE: usize = std::mem::size_of::<RayRecord>();

const BATCH_HEADER_SIZE: usize = 8;

/// What a ray is being traced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RayKind {
    Primary,
    Shadow,
    Secondary,
}

impl RayKind {
    fn to_wire(self) -> u32 {
        match self {
            RayKind::Primary => 0,
            RayKind::Shadow => 1,
            RayKind::Secondary => 2,
        }
    }

    fn from_wire(v: u32) -> Result<Self, WireError> {
        match v {
            0 => Ok(RayKind::Primary),
            1 => Ok(RayKind::Shadow),
            2 => Ok(RayKind::Secondary),
            other => Err(WireError::InvalidRayKind(other)),
        }
    }
}

/// A ray in flight through the distributed scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    /// Origin point of the ray
    pub origin: Vec3,
    /// Direction vector (not necessarily normalized)
    pub direction: Vec3,
    /// Accumulated throughput (multiplies whatever radiance the ray finds)
    pub color: Vec3,
    /// Weight of this ray's contribution to its pixel
    pub weight: f32,
    /// Remaining bounce budget
    pub depth: u32,
    /// Framebuffer index the ray contributes to
    pub pixel: u32,
    /// Domain whose adapter must process the ray next
    pub target: DomainId,
    pub kind: RayKind,
}

impl Ray {
    /// Create a primary ray for a pixel with unit throughput.
    pub fn primary(origin: Vec3, direction: Vec3, pixel: u32, weight: f32, depth: u32) -> Self {
        Self {
            origin,
            direction,
            color: Vec3::ONE,
            weight,
            depth,
            pixel,
            target: 0,
            kind: RayKind::Primary,
        }
    }

    /// Set the target domain.
    pub fn with_target(mut self, target: DomainId) -> Self {
        self.target = target;
        self
    }

    /// Compute a point along the ray at parameter t.
    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + t * self.direction
    }

    /// Pack into the fixed-size wire record.
    pub fn pack(&self, out: &mut Vec<u8>) {
        let record = RayRecord {
            origin: self.origin.to_array(),
            direction: self.direction.to_array(),
            color: self.color.to_array(),
            weight: self.weight,
            depth: self.depth,
            pixel: self.pixel,
            target: self.target,
            kind: self.kind.to_wire(),
        };
        out.extend_from_slice(bytemuck::bytes_of(&record));
    }

    /// Unpack from exactly one wire record.
    pub fn unpack(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != RAY_RECORD_SIZE {
            return Err(WireError::Truncated {
                expected: RAY_RECORD_SIZE,
                actual: bytes.len(),
            });
        }
        let record: RayRecord = bytemuck::pod_read_unaligned(bytes);
        Ok(Self {
            origin: Vec3::from_array(record.origin),
            direction: Vec3::from_array(record.direction),
            color: Vec3::from_array(record.color),
            weight: record.weight,
            depth: record.depth,
            pixel: record.pixel,
            target: record.target,
            kind: RayKind::from_wire(record.kind)?,
        })
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RayRecord {
    origin: [f32; 3],
    direction: [f32; 3],
    color: [f32; 3],
    weight: f32,
    depth: u32,
    pixel: u32,
    target: u32,
    kind: u32,
}

/// Encode a batch of rays bound for one domain.
pub fn encode_batch(domain: DomainId, rays: &[Ray]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BATCH_HEADER_SIZE + rays.len() * RAY_RECORD_SIZE);
    out.extend_from_slice(&domain.to_le_bytes());
    out.extend_from_slice(&(rays.len() as u32).to_le_bytes());
    for ray in rays {
        ray.pack(&mut out);
    }
    out
}

/// Decode a batch produced by [`encode_batch`].
///
/// Every ray in the batch must target the batch's domain.
pub fn decode_batch(bytes: &[u8]) -> Result<(DomainId, RayBatch), WireError> {
    if bytes.len() < BATCH_HEADER_SIZE {
        return Err(WireError::Truncated {
            expected: BATCH_HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    let domain = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let count = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;

    let body = &bytes[BATCH_HEADER_SIZE..];
    if body.len() % RAY_RECORD_SIZE != 0 {
        return Err(WireError::Misaligned {
            actual: body.len(),
            record: RAY_RECORD_SIZE,
        });
    }
    let expected = count * RAY_RECORD_SIZE;
    if body.len() != expected {
        return Err(WireError::Truncated {
            expected: BATCH_HEADER_SIZE + expected,
            actual: bytes.len(),
        });
    }

    let mut rays = Vec::with_capacity(count);
    for chunk in body.chunks_exact(RAY_RECORD_SIZE) {
        let ray = Ray::unpack(chunk)?;
        if ray.target != domain {
            return Err(WireError::ForeignRay {
                domain,
                target: ray.target,
            });
        }
        rays.push(ray);
    }
    Ok((domain, rays))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ray() -> Ray {
        Ray {
            origin: Vec3::new(1.5, -2.25, 3.125),
            direction: Vec3::new(0.0, -0.6, 0.8),
            color: Vec3::new(0.25, 0.5, 0.75),
            weight: 0.1,
            depth: 7,
            pixel: 4242,
            target: 3,
            kind: RayKind::Secondary,
        }
    }

    #[test]
    fn test_record_size_is_fixed() {
        // Ten f32 fields, then depth, pixel, target and kind as u32
        assert_eq!(RAY_RECORD_SIZE, 10 * 4 + 4 * 4);
        assert_eq!(RAY_RECORD_SIZE, 56);
    }

    #[test]
    fn test_pack_unpack_bit_exact() {
        let ray = sample_ray();
        let mut bytes = Vec::new();
        ray.pack(&mut bytes);
        let back = Ray::unpack(&bytes).unwrap();

        assert_eq!(back.origin.x.to_bits(), ray.origin.x.to_bits());
        assert_eq!(back.direction.z.to_bits(), ray.direction.z.to_bits());
        assert_eq!(back.weight.to_bits(), ray.weight.to_bits());
        assert_eq!(back, ray);
    }

    #[test]
    fn test_batch_roundtrip() {
        let rays = vec![sample_ray(), sample_ray().with_target(3)];
        let bytes = encode_batch(3, &rays);
        let (domain, back) = decode_batch(&bytes).unwrap();

        assert_eq!(domain, 3);
        assert_eq!(back, rays);
    }

    #[test]
    fn test_batch_rejects_truncation() {
        let bytes = encode_batch(3, &[sample_ray()]);
        let err = decode_batch(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, WireError::Misaligned { .. }));

        let err = decode_batch(&bytes[..4]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn test_batch_rejects_foreign_ray() {
        let bytes = encode_batch(9, &[sample_ray()]);
        assert_eq!(
            decode_batch(&bytes).unwrap_err(),
            WireError::ForeignRay { domain: 9, target: 3 }
        );
    }

    #[test]
    fn test_invalid_kind() {
        let mut bytes = Vec::new();
        sample_ray().pack(&mut bytes);
        let last = bytes.len() - 4;
        bytes[last..].copy_from_slice(&77u32.to_ne_bytes());
        assert_eq!(Ray::unpack(&bytes).unwrap_err(), WireError::InvalidRayKind(77));
    }
}
