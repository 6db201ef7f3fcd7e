//! Pinhole camera for primary-ray generation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use strata_core::{Ray, RayBatch, Scene, Tile};
use strata_math::Vec3;

/// Camera for generating primary rays into the scene.
#[derive(Clone, Debug)]
pub struct Camera {
    // Image settings
    pub image_width: u32,
    pub image_height: u32,
    pub samples_per_pixel: u32,
    pub max_depth: u32,

    // Camera positioning
    look_from: Vec3,
    look_at: Vec3,
    vup: Vec3,

    /// Vertical field of view in degrees
    vfov: f32,

    // Cached computed values (set by initialize())
    center: Vec3,
    pixel00_loc: Vec3,
    pixel_delta_u: Vec3,
    pixel_delta_v: Vec3,
    samples_scale: f32,
}

impl Camera {
    /// Create a new camera with default settings.
    pub fn new() -> Self {
        Self {
            image_width: 320,
            image_height: 180,
            samples_per_pixel: 4,
            max_depth: 8,
            look_from: Vec3::new(0.0, 0.0, 0.0),
            look_at: Vec3::new(0.0, 0.0, -1.0),
            vup: Vec3::Y,
            vfov: 90.0,
            center: Vec3::ZERO,
            pixel00_loc: Vec3::ZERO,
            pixel_delta_u: Vec3::ZERO,
            pixel_delta_v: Vec3::ZERO,
            samples_scale: 0.25,
        }
    }

    /// Camera looking at `scene` from its stored viewpoint, initialized.
    pub fn for_scene(scene: &Scene, width: u32, height: u32, samples: u32, max_depth: u32) -> Self {
        let mut camera = Camera::new()
            .with_resolution(width, height)
            .with_quality(samples, max_depth)
            .with_position(scene.look_from, scene.look_at, Vec3::Y)
            .with_fov(scene.vfov);
        camera.initialize();
        camera
    }

    /// Set image resolution.
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.image_width = width;
        self.image_height = height;
        self
    }

    /// Set quality settings.
    pub fn with_quality(mut self, samples: u32, max_depth: u32) -> Self {
        self.samples_per_pixel = samples;
        self.max_depth = max_depth;
        self
    }

    /// Set camera position.
    pub fn with_position(mut self, look_from: Vec3, look_at: Vec3, vup: Vec3) -> Self {
        self.look_from = look_from;
        self.look_at = look_at;
        self.vup = vup;
        self
    }

    /// Set vertical field of view in degrees.
    pub fn with_fov(mut self, vfov: f32) -> Self {
        self.vfov = vfov;
        self
    }

    /// Initialize the camera (must be called before generating rays).
    pub fn initialize(&mut self) {
        self.samples_scale = 1.0 / self.samples_per_pixel.max(1) as f32;
        self.center = self.look_from;

        let focus_dist = (self.look_from - self.look_at).length().max(1e-3);
        let theta = self.vfov.to_radians();
        let h = (theta / 2.0).tan();
        let viewport_height = 2.0 * h * focus_dist;
        let viewport_width = viewport_height * (self.image_width as f32 / self.image_height.max(1) as f32);

        // Camera basis
        let w = (self.look_from - self.look_at).normalize();
        let u = self.vup.cross(w).normalize();
        let v = w.cross(u);

        let viewport_u = viewport_width * u;
        let viewport_v = -viewport_height * v;

        self.pixel_delta_u = viewport_u / self.image_width.max(1) as f32;
        self.pixel_delta_v = viewport_v / self.image_height.max(1) as f32;

        let viewport_upper_left = self.center - focus_dist * w - viewport_u / 2.0 - viewport_v / 2.0;
        self.pixel00_loc = viewport_upper_left + 0.5 * (self.pixel_delta_u + self.pixel_delta_v);
    }

    /// Generate a ray for pixel (i, j) with random sampling.
    pub fn get_ray(&self, i: u32, j: u32, rng: &mut impl Rng) -> Ray {
        let offset = sample_square(rng);
        let pixel_sample = self.pixel00_loc
            + ((i as f32) + offset.x) * self.pixel_delta_u
            + ((j as f32) + offset.y) * self.pixel_delta_v;

        let pixel = j * self.image_width + i;
        Ray::primary(self.center, pixel_sample - self.center, pixel, self.samples_scale, self.max_depth)
    }

    /// Every primary ray for a tile, `samples_per_pixel` per pixel.
    ///
    /// Rows are generated in parallel; each row's sampler is seeded from
    /// `seed` and the row index so output does not depend on scheduling.
    pub fn generate(&self, tile: &Tile, seed: u64) -> RayBatch {
        (tile.y..tile.y + tile.height)
            .into_par_iter()
            .flat_map_iter(|y| {
                let mut rng = StdRng::seed_from_u64(seed ^ ((y as u64) << 20));
                let mut row = Vec::with_capacity((tile.width * self.samples_per_pixel) as usize);
                for x in tile.x..tile.x + tile.width {
                    for _ in 0..self.samples_per_pixel {
                        row.push(self.get_ray(x, y, &mut rng));
                    }
                }
                row
            })
            .collect()
    }

    /// Get the samples scale factor (1 / samples_per_pixel).
    pub fn samples_scale(&self) -> f32 {
        self.samples_scale
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new()
    }
}

/// Sample a random point in the unit square [-0.5, 0.5] x [-0.5, 0.5].
fn sample_square(rng: &mut impl Rng) -> Vec3 {
    Vec3::new(rng.gen::<f32>() - 0.5, rng.gen::<f32>() - 0.5, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_ray_direction() {
        let mut camera = Camera::new()
            .with_resolution(100, 100)
            .with_position(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), Vec3::Y)
            .with_fov(90.0);
        camera.initialize();

        let mut rng = StdRng::seed_from_u64(42);

        // Center ray should point roughly towards -Z
        let ray = camera.get_ray(50, 50, &mut rng);
        assert!(ray.direction.z < 0.0);
        assert_eq!(ray.pixel, 50 * 100 + 50);
    }

    #[test]
    fn test_generate_covers_tile() {
        let camera = Camera::for_scene(&Scene::grid([1, 1, 1]), 16, 8, 3, 5);
        let tile = Tile::new(0, 2, 16, 4);
        let rays = camera.generate(&tile, 9);

        assert_eq!(rays.len(), 16 * 4 * 3);
        assert!(rays.iter().all(|r| r.depth == 5));
        assert!(rays.iter().all(|r| (r.weight - 1.0 / 3.0).abs() < 1e-6));
        assert_eq!(rays.iter().map(|r| r.pixel).min(), Some(2 * 16));
        assert_eq!(rays.iter().map(|r| r.pixel).max(), Some(6 * 16 - 1));
    }

    #[test]
    fn test_generate_is_deterministic() {
        let camera = Camera::for_scene(&Scene::grid([2, 2, 1]), 8, 8, 2, 3);
        let tile = Tile::new(0, 0, 8, 8);
        assert_eq!(camera.generate(&tile, 5), camera.generate(&tile, 5));
    }

    #[test]
    fn test_empty_tile() {
        let camera = Camera::for_scene(&Scene::new(), 8, 8, 2, 3);
        assert!(camera.generate(&Tile::new(0, 8, 8, 0), 1).is_empty());
    }
}
