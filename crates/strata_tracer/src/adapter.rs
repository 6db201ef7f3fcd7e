//! Intersection adapters and the single-adapter slot.
//!
//! An adapter is the per-domain intersection engine. It consumes a whole
//! batch of rays aimed at its domain, deposits the radiance of rays that
//! terminate into the film and returns continuation rays retargeted to
//! whatever domain they need next.

use strata_core::{Domain, DomainId, Film, RayBatch};

use crate::error::TraceError;

/// Per-domain intersection engine.
pub trait Adapter: Send {
    /// Trace every ray in `rays` against `domain`.
    ///
    /// Continuation rays are appended to `out`; rays that terminate are
    /// deposited into `film`. Returns the number of terminated rays.
    fn trace(&mut self, rays: RayBatch, domain: &Domain, out: &mut RayBatch, film: &mut Film) -> Result<usize, TraceError>;
}

/// Builds the adapter for a domain on activation.
pub trait AdapterFactory: Send {
    fn create(&self, domain: &Domain) -> Result<Box<dyn Adapter>, TraceError>;
}

impl<F> AdapterFactory for F
where
    F: Fn(&Domain) -> Result<Box<dyn Adapter>, TraceError> + Send,
{
    fn create(&self, domain: &Domain) -> Result<Box<dyn Adapter>, TraceError> {
        self(domain)
    }
}

/// Holds at most one live adapter.
///
/// Activating a different domain drops the current adapter before the next
/// one is built.
pub struct AdapterSlot {
    factory: Box<dyn AdapterFactory>,
    active: Option<(DomainId, Box<dyn Adapter>)>,
    activations: u64,
}

impl AdapterSlot {
    pub fn new(factory: Box<dyn AdapterFactory>) -> Self {
        Self {
            factory,
            active: None,
            activations: 0,
        }
    }

    /// Adapter for `domain`, building it if another domain is active.
    pub fn activate(&mut self, domain: &Domain) -> Result<&mut dyn Adapter, TraceError> {
        let current = matches!(&self.active, Some((id, _)) if *id == domain.id);
        if !current {
            self.release();
            let adapter = self.factory.create(domain)?;
            log::debug!("activated adapter for domain {}", domain.id);
            self.activations += 1;
            self.active = Some((domain.id, adapter));
        }
        match self.active.as_mut() {
            Some((_, adapter)) => Ok(adapter.as_mut()),
            None => Err(TraceError::UnknownDomain(domain.id)),
        }
    }

    /// Drop the live adapter, if any.
    pub fn release(&mut self) {
        if let Some((id, adapter)) = self.active.take() {
            drop(adapter);
            log::debug!("released adapter for domain {}", id);
        }
    }

    pub fn active_domain(&self) -> Option<DomainId> {
        self.active.as_ref().map(|(id, _)| *id)
    }

    /// Number of adapters built so far.
    pub fn activations(&self) -> u64 {
        self.activations
    }
}
