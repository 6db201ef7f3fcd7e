//! Strata Tracer - distributed domain tracing on top of `strata_comm`.
//!
//! This crate provides:
//!
//! - **Routing**: `RayRouter` queues rays per owned domain and forwards the rest
//! - **Tracing**: `DomainTracer` runs GENERATE, ROUTE, SELECT, TRACE and SHUFFLE
//! - **Termination**: lockstep ray tally plus done test, or a two-phase vote
//! - **Adapters**: the `Adapter` contract, a single-slot holder and a sphere reference
//! - **Node**: the per-rank worker and a runner for whole renders
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata_core::{OwnershipTable, RenderOptions, Scene};
//! use strata_tracer::{run_local_cluster, Node, SphereAdapterFactory};
//!
//! let options = RenderOptions::default().with_resolution(64, 36);
//! let scene = Arc::new(Scene::grid(options.domain_grid));
//! let ownership = Arc::new(OwnershipTable::round_robin(scene.domain_count(), 2));
//!
//! let reports = run_local_cluster(2, |_rank| {
//!     let factory = SphereAdapterFactory::new(Arc::clone(&scene), options.seed);
//!     Node::new(options.clone(), Arc::clone(&scene), Arc::clone(&ownership), Box::new(factory))
//! })
//! .unwrap();
//! assert_eq!(reports.len(), 2);
//! ```

pub mod adapter;
pub mod camera;
pub mod counters;
pub mod error;
pub mod node;
pub mod profiler;
pub mod router;
pub mod sphere;
pub mod termination;
pub mod tracer;
pub mod voter;
pub mod works;

pub use adapter::{Adapter, AdapterFactory, AdapterSlot};
pub use camera::Camera;
pub use counters::{RayCountSnapshot, RayCounters};
pub use error::TraceError;
pub use node::{run_local_cluster, FrameCallback, FrameReport, FrameSignal, Node, NodeReport, RankContext};
pub use profiler::{Phase, Profiler};
pub use router::{FilterStats, RayRouter, Shipment};
pub use sphere::{SphereAdapter, SphereAdapterFactory};
pub use termination::{DoneTest, Tally, TermState, Termination};
pub use tracer::{DomainTracer, Iteration};
pub use voter::{Decision, Voter, VoterState};
