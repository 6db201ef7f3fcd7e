//! Strata Core - data model shared by every rank.
//!
//! This crate provides:
//!
//! - **Rays**: the routable `Ray` and its fixed-size wire record
//! - **Scene**: `Domain`s (spatially distinct instances) and the `Scene` locator
//! - **Ownership**: the immutable instance → rank `OwnershipTable`
//! - **Tiles / Film**: image partitioning and per-rank framebuffers
//! - **Options**: `RenderOptions`, loadable from JSON

pub mod error;
pub mod film;
pub mod options;
pub mod ownership;
pub mod ray;
pub mod scene;
pub mod tile;

pub use error::{OptionsError, WireError};
pub use film::{color_to_rgba, Color, Film};
pub use options::{RenderOptions, SchedulerMode};
pub use ownership::{OwnershipTable, Rank};
pub use ray::{decode_batch, encode_batch, DomainId, Ray, RayBatch, RayKind, RAY_RECORD_SIZE};
pub use scene::{Domain, DomainShape, Scene, SurfaceDesc};
pub use tile::Tile;
