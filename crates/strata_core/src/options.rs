//! Render options.
//!
//! Every rank must run with identical options. They are plain data with
//! defaults for every field, so a JSON file only needs to name what it
//! changes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::OptionsError;

/// How ranks decide that a frame is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerMode {
    /// Lockstep iterations: collective ray tally plus done-test round
    SyncDomain,
    /// Free-running ranks: rank 0 runs a two-phase vote when idle
    AsyncDomain,
}

/// Render configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Primary rays per pixel
    pub samples_per_pixel: u32,
    /// Maximum ray bounce depth
    pub max_depth: u32,
    /// Number of frames to render
    pub num_frames: u32,
    pub scheduler: SchedulerMode,
    /// Domain counts along X, Y, Z for the reference grid scene
    pub domain_grid: [u32; 3],
    /// Seed for camera jitter and scattering
    pub seed: u64,
    /// How long an idle rank waits for messages before re-checking (ms)
    pub idle_wait_ms: u64,
    /// Output image path written by rank 0
    pub output: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            width: 320,
            height: 180,
            samples_per_pixel: 4,
            max_depth: 8,
            num_frames: 1,
            scheduler: SchedulerMode::AsyncDomain,
            domain_grid: [2, 2, 1],
            seed: 42,
            idle_wait_ms: 2,
            output: "strata.png".to_string(),
        }
    }
}

impl RenderOptions {
    /// Set image resolution.
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set quality settings.
    pub fn with_quality(mut self, samples: u32, max_depth: u32) -> Self {
        self.samples_per_pixel = samples;
        self.max_depth = max_depth;
        self
    }

    /// Set the scheduler mode.
    pub fn with_scheduler(mut self, scheduler: SchedulerMode) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Set the reference scene's domain grid.
    pub fn with_domain_grid(mut self, grid: [u32; 3]) -> Self {
        self.domain_grid = grid;
        self
    }

    /// Set the number of frames.
    pub fn with_frames(mut self, frames: u32) -> Self {
        self.num_frames = frames;
        self
    }

    /// Parse options from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, OptionsError> {
        let options: RenderOptions = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, OptionsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let options = Self::from_json_str(&text)?;
        log::debug!("loaded render options from {}", path.display());
        Ok(options)
    }

    /// Reject option sets no rank could render.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.width == 0 || self.height == 0 {
            return Err(OptionsError::Invalid(format!(
                "resolution {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.samples_per_pixel == 0 {
            return Err(OptionsError::Invalid("samples_per_pixel must be at least 1".into()));
        }
        if self.domain_grid.iter().any(|&n| n == 0) {
            return Err(OptionsError::Invalid("domain_grid counts must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let options = RenderOptions::from_json_str(r#"{ "width": 64, "scheduler": "SyncDomain" }"#).unwrap();

        assert_eq!(options.width, 64);
        assert_eq!(options.height, RenderOptions::default().height);
        assert_eq!(options.scheduler, SchedulerMode::SyncDomain);
    }

    #[test]
    fn test_invalid_options_rejected() {
        assert!(RenderOptions::from_json_str(r#"{ "width": 0 }"#).is_err());
        assert!(RenderOptions::from_json_str(r#"{ "domain_grid": [1, 0, 1] }"#).is_err());
        assert!(RenderOptions::from_json_str("not json").is_err());
    }

    #[test]
    fn test_image_parallel_schedulers_rejected() {
        for mode in ["SyncImage", "AsyncImage"] {
            let json = format!(r#"{{ "scheduler": "{}" }}"#, mode);
            assert!(matches!(RenderOptions::from_json_str(&json), Err(OptionsError::Json(_))), "{}", mode);
        }
    }

    #[test]
    fn test_load_from_file() {
        let _ = env_logger::builder().is_test(true).try_init();
        let path = std::env::temp_dir().join(format!("strata_options_{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "num_frames": 3, "domain_grid": [3, 1, 1] }"#).unwrap();

        let options = RenderOptions::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(options.num_frames, 3);
        assert_eq!(options.domain_grid, [3, 1, 1]);
        assert!(matches!(
            RenderOptions::from_json_file(&path),
            Err(OptionsError::Io(_))
        ));
    }

    #[test]
    fn test_builders() {
        let options = RenderOptions::default()
            .with_resolution(10, 20)
            .with_quality(2, 3)
            .with_frames(5);

        assert_eq!((options.width, options.height), (10, 20));
        assert_eq!((options.samples_per_pixel, options.max_depth), (2, 3));
        assert_eq!(options.num_frames, 5);
        assert!(options.validate().is_ok());
    }
}
