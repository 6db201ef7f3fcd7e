//! Reference adapter for the sphere-grid scene.
//!
//! Each domain holds one sphere. Rays that hit scatter off its surface and
//! continue toward the next domain along their new direction; rays that
//! miss pass through the domain's box and continue from its far side. A ray
//! with no further domain picks up the background and terminates.

use std::f32::consts::PI;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use strata_core::{Color, Domain, DomainShape, Film, Ray, RayBatch, RayKind, Scene, SurfaceDesc};
use strata_math::{Interval, Vec3};

use crate::adapter::{Adapter, AdapterFactory};
use crate::error::TraceError;

const HIT_EPSILON: f32 = 1e-3;

/// Surface hit on a domain's sphere.
#[derive(Debug, Clone, Copy)]
pub struct HitRecord {
    pub p: Vec3,
    /// Unit normal facing against the ray
    pub normal: Vec3,
    pub t: f32,
    pub front_face: bool,
}

/// Intersect a ray with a sphere within `ray_t`.
pub fn hit_sphere(center: Vec3, radius: f32, origin: Vec3, direction: Vec3, ray_t: Interval) -> Option<HitRecord> {
    let oc = center - origin;
    let a = direction.length_squared();
    let h = direction.dot(oc);
    let c = oc.length_squared() - radius * radius;

    let discriminant = h * h - a * c;
    if discriminant < 0.0 || a == 0.0 {
        return None;
    }
    let sqrtd = discriminant.sqrt();

    // Nearest root in range
    let mut root = (h - sqrtd) / a;
    if !ray_t.surrounds(root) {
        root = (h + sqrtd) / a;
        if !ray_t.surrounds(root) {
            return None;
        }
    }

    let p = origin + root * direction;
    let outward = (p - center) / radius;
    let front_face = direction.dot(outward) < 0.0;
    Some(HitRecord {
        p,
        normal: if front_face { outward } else { -outward },
        t: root,
        front_face,
    })
}

/// Scatter a ray off a surface.
///
/// Returns `(attenuation, direction)` or `None` if the ray is absorbed.
pub fn scatter(surface: &SurfaceDesc, direction: Vec3, rec: &HitRecord, rng: &mut impl Rng) -> Option<(Color, Vec3)> {
    match *surface {
        SurfaceDesc::Lambertian { albedo } => {
            let mut dir = rec.normal + random_unit_vector(rng);
            // Catch degenerate scatter direction
            if dir.length_squared() < 1e-8 {
                dir = rec.normal;
            }
            Some((albedo, dir))
        }
        SurfaceDesc::Metal { albedo, fuzz } => {
            let reflected = reflect(direction.normalize(), rec.normal);
            let dir = reflected + fuzz.clamp(0.0, 1.0) * random_unit_vector(rng);
            (dir.dot(rec.normal) > 0.0).then_some((albedo, dir))
        }
        SurfaceDesc::Emissive { .. } => None,
    }
}

/// Light emitted by a surface.
pub fn emitted(surface: &SurfaceDesc) -> Color {
    match *surface {
        SurfaceDesc::Emissive { emit } => emit,
        _ => Color::ZERO,
    }
}

#[inline]
fn reflect(v: Vec3, n: Vec3) -> Vec3 {
    v - 2.0 * v.dot(n) * n
}

fn random_unit_vector(rng: &mut impl Rng) -> Vec3 {
    // Uniform on the sphere from two angles
    let z: f32 = rng.gen_range(-1.0..1.0);
    let phi: f32 = rng.gen_range(0.0..2.0 * PI);
    let r = (1.0 - z * z).max(0.0).sqrt();
    Vec3::new(r * phi.cos(), r * phi.sin(), z)
}

/// Outcome of shading one ray inside a domain.
enum Shaded {
    Continue(Ray),
    Deposit { pixel: u32, color: Color },
    Absorbed,
}

/// Builds [`SphereAdapter`]s over a shared scene.
pub struct SphereAdapterFactory {
    scene: Arc<Scene>,
    seed: u64,
}

impl SphereAdapterFactory {
    pub fn new(scene: Arc<Scene>, seed: u64) -> Self {
        Self { scene, seed }
    }
}

impl AdapterFactory for SphereAdapterFactory {
    fn create(&self, domain: &Domain) -> Result<Box<dyn Adapter>, TraceError> {
        if self.scene.domain(domain.id).is_none() {
            return Err(TraceError::UnknownDomain(domain.id));
        }
        Ok(Box::new(SphereAdapter {
            scene: Arc::clone(&self.scene),
            seed: self.seed ^ (domain.id as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15),
            batches: 0,
        }))
    }
}

/// Path-tracing adapter for one sphere domain.
pub struct SphereAdapter {
    scene: Arc<Scene>,
    seed: u64,
    batches: u64,
}

impl SphereAdapter {
    fn shade(&self, ray: Ray, domain: &Domain, rng: &mut StdRng) -> Shaded {
        let DomainShape::Sphere { center, radius } = domain.shape;
        let hit = hit_sphere(center, radius, ray.origin, ray.direction, Interval::new(HIT_EPSILON, f32::INFINITY));

        let Some(rec) = hit else {
            // Pass through: continue from the far side of the box
            let exit = domain
                .bounds
                .intersect(ray.origin, ray.direction, Interval::new(0.0, f32::INFINITY))
                .map_or(0.0, |span| span.max);
            return self.forward(Ray { origin: ray.at(exit), ..ray }, domain);
        };

        let emit = emitted(&domain.surface);
        if emit != Color::ZERO {
            return Shaded::Deposit {
                pixel: ray.pixel,
                color: ray.weight * ray.color * emit,
            };
        }
        if ray.depth == 0 {
            return Shaded::Absorbed;
        }
        match scatter(&domain.surface, ray.direction, &rec, rng) {
            Some((attenuation, direction)) => {
                let next = Ray {
                    origin: rec.p,
                    direction,
                    color: ray.color * attenuation,
                    depth: ray.depth - 1,
                    kind: RayKind::Secondary,
                    ..ray
                };
                self.forward(next, domain)
            }
            None => Shaded::Absorbed,
        }
    }

    /// Retarget a ray leaving `domain`, or terminate it against the background.
    fn forward(&self, ray: Ray, domain: &Domain) -> Shaded {
        match self.scene.locate(ray.origin, ray.direction, Some(domain.id)) {
            Some((next, _)) => Shaded::Continue(ray.with_target(next)),
            None => Shaded::Deposit {
                pixel: ray.pixel,
                color: ray.weight * ray.color * self.scene.background,
            },
        }
    }
}

impl Adapter for SphereAdapter {
    fn trace(&mut self, rays: RayBatch, domain: &Domain, out: &mut RayBatch, film: &mut Film) -> Result<usize, TraceError> {
        self.batches += 1;
        let batch_seed = self.seed.wrapping_add(self.batches.wrapping_mul(0xbf58_476d_1ce4_e5b9));
        let this = &*self;

        let shaded: Vec<Shaded> = rays
            .into_par_iter()
            .enumerate()
            .map(|(i, ray)| {
                let mut rng = StdRng::seed_from_u64(batch_seed ^ (i as u64) ^ ((ray.pixel as u64) << 32));
                this.shade(ray, domain, &mut rng)
            })
            .collect();

        let mut terminated = 0;
        for result in shaded {
            match result {
                Shaded::Continue(ray) => out.push(ray),
                Shaded::Deposit { pixel, color } => {
                    film.accumulate(pixel, color);
                    terminated += 1;
                }
                Shaded::Absorbed => terminated += 1,
            }
        }
        Ok(terminated)
    }
}
