//! Scene description shared by every rank.
//!
//! The scene is a flat list of domains. Each domain is a spatially distinct
//! piece of geometry with a bounding box; which rank owns it is decided
//! separately by the `OwnershipTable`.

use strata_math::{Aabb, Interval, Vec3};

use crate::ray::DomainId;
use crate::Color;

/// Smallest ray parameter considered when locating the next domain.
pub const LOCATE_EPSILON: f32 = 1e-4;

/// Geometry contained in a domain.
#[derive(Clone, Debug, PartialEq)]
pub enum DomainShape {
    Sphere { center: Vec3, radius: f32 },
}

/// Surface response of a domain's geometry.
#[derive(Clone, Debug, PartialEq)]
pub enum SurfaceDesc {
    /// Diffuse reflector
    Lambertian { albedo: Color },
    /// Specular reflector; `fuzz` 0.0 = perfect mirror
    Metal { albedo: Color, fuzz: f32 },
    /// Light emitter, never scatters
    Emissive { emit: Color },
}

/// A domain (mesh instance) of the scene.
#[derive(Clone, Debug)]
pub struct Domain {
    pub id: DomainId,
    /// World-space bounds; rays are routed by clipping against these
    pub bounds: Aabb,
    pub shape: DomainShape,
    pub surface: SurfaceDesc,
}

/// A complete scene: domains plus the viewpoint and background.
#[derive(Clone, Debug)]
pub struct Scene {
    pub domains: Vec<Domain>,
    pub background: Color,
    pub look_from: Vec3,
    pub look_at: Vec3,
    pub vfov: f32,
}

impl Scene {
    /// Create an empty scene with a default viewpoint.
    pub fn new() -> Self {
        Self {
            domains: Vec::new(),
            background: Color::new(0.7, 0.8, 1.0),
            look_from: Vec3::new(0.0, 0.0, 5.0),
            look_at: Vec3::ZERO,
            vfov: 40.0,
        }
    }

    /// Add a domain and return its id.
    pub fn add_domain(&mut self, bounds: Aabb, shape: DomainShape, surface: SurfaceDesc) -> DomainId {
        let id = self.domains.len() as DomainId;
        self.domains.push(Domain {
            id,
            bounds,
            shape,
            surface,
        });
        id
    }

    /// Get a domain by id.
    pub fn domain(&self, id: DomainId) -> Option<&Domain> {
        self.domains.get(id as usize)
    }

    /// Get domain count.
    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    /// Build the reference scene: an `nx * ny * nz` grid of sphere domains.
    ///
    /// Every cell is a cube of side `CELL`; its sphere is centred in the cell
    /// so that neighbouring domains never overlap.
    pub fn grid(counts: [u32; 3]) -> Self {
        const CELL: f32 = 2.5;
        const RADIUS: f32 = 1.0;

        let mut scene = Scene::new();
        let [nx, ny, nz] = counts.map(|c| c.max(1));
        let extent = Vec3::new(nx as f32, ny as f32, nz as f32) * CELL;
        let base = -0.5 * extent;

        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let min = base + Vec3::new(i as f32, j as f32, k as f32) * CELL;
                    let bounds = Aabb::from_points(min, min + Vec3::splat(CELL));
                    let center = bounds.centroid();
                    let index = scene.domains.len();
                    let surface = match index % 4 {
                        3 => SurfaceDesc::Metal {
                            albedo: Color::new(0.8, 0.8, 0.85),
                            fuzz: 0.1,
                        },
                        n => SurfaceDesc::Lambertian {
                            albedo: PALETTE[n],
                        },
                    };
                    scene.add_domain(bounds, DomainShape::Sphere { center, radius: RADIUS }, surface);
                }
            }
        }

        let radius = extent.length() * 0.5;
        scene.look_at = Vec3::ZERO;
        scene.look_from = Vec3::new(0.3 * radius, 0.6 * radius, 2.5 * radius + CELL);
        scene
    }

    /// Find the nearest domain a ray enters.
    ///
    /// Domains are clipped against `(LOCATE_EPSILON, inf)`; a ray that starts
    /// inside a box locates that box at its own origin. Ties on the entry
    /// distance go to the lowest id. `exclude` skips one domain, typically
    /// the one the ray is leaving.
    pub fn locate(&self, origin: Vec3, direction: Vec3, exclude: Option<DomainId>) -> Option<(DomainId, Interval)> {
        let ray_t = Interval::new(LOCATE_EPSILON, f32::INFINITY);
        let mut best: Option<(DomainId, Interval)> = None;

        for domain in &self.domains {
            if Some(domain.id) == exclude {
                continue;
            }
            if let Some(span) = domain.bounds.intersect(origin, direction, ray_t) {
                let closer = match best {
                    Some((_, b)) => span.min < b.min,
                    None => true,
                };
                if closer {
                    best = Some((domain.id, span));
                }
            }
        }

        best
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

const PALETTE: [Color; 3] = [
    Color::new(0.8, 0.3, 0.3),
    Color::new(0.3, 0.8, 0.4),
    Color::new(0.3, 0.4, 0.8),
];
