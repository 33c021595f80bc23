//! Bootstrapper lifecycle
//!
//! Bootstrapping keys are large and specific to a slot count, so one
//! bootstrapper is created per distinct slot count and shared by every
//! ciphertext of that size. They are all released together when the owning
//! [`Scheme`](crate::Scheme) is closed or dropped.

use std::collections::BTreeMap;

use tracing::debug;

use crate::backend::{Backend, BootstrapperId, CiphertextId};
use crate::error::{BackendContext, Result};
use crate::params::SchemeParams;
use crate::tensor::CipherTensor;

/// Bootstrappers created so far, keyed by slot count
#[derive(Debug, Default)]
pub struct BootstrapContext {
    by_slots: BTreeMap<usize, BootstrapperId>,
}

impl BootstrapContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, slots: usize) -> Option<BootstrapperId> {
        self.by_slots.get(&slots).copied()
    }

    /// Slot counts with a live bootstrapper, ascending
    pub fn slot_counts(&self) -> Vec<usize> {
        self.by_slots.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.by_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_slots.is_empty()
    }

    /// Release every bootstrapper with a single backend call
    pub(crate) fn release<B: Backend>(&mut self, backend: &mut B) -> Result<()> {
        let count = self.by_slots.len();
        self.by_slots.clear();
        backend
            .delete_bootstrappers()
            .with_op("DeleteBootstrappers", String::new)?;
        debug!(count, "released bootstrappers");
        Ok(())
    }
}

/// Requests bootstrap operations on behalf of a scheme
pub struct Bootstrapper<'a, B: Backend> {
    backend: &'a mut B,
    params: &'a SchemeParams,
    context: &'a mut BootstrapContext,
}

impl<'a, B: Backend> Bootstrapper<'a, B> {
    pub fn new(
        backend: &'a mut B,
        params: &'a SchemeParams,
        context: &'a mut BootstrapContext,
    ) -> Self {
        Self {
            backend,
            params,
            context,
        }
    }

    /// Ensure a bootstrapper for `slots` exists and return it.
    ///
    /// The key-switching moduli come from `params.boot_logp`. A second call
    /// for the same slot count reuses the existing bootstrapper.
    pub fn generate_bootstrapper(&mut self, slots: usize) -> Result<BootstrapperId> {
        if let Some(id) = self.context.get(slots) {
            return Ok(id);
        }
        let logp = &self.params.boot_logp;
        let id = self
            .backend
            .new_bootstrapper(logp, slots)
            .with_op("NewBootstrapper", || format!("logp={:?}, slots={}", logp, slots))?;
        self.context.by_slots.insert(slots, id);
        debug!(slots, bootstrapper = %id, "created bootstrapper");
        Ok(id)
    }

    /// Refresh one ciphertext
    pub fn bootstrap(&mut self, ciphertext: CiphertextId, slots: usize) -> Result<CiphertextId> {
        self.backend
            .bootstrap(ciphertext, slots)
            .with_op("Bootstrap", || format!("ciphertext={}, slots={}", ciphertext, slots))
    }

    /// Refresh every tile of `tensor`, keeping its shapes
    pub fn bootstrap_tensor(&mut self, tensor: &CipherTensor, slots: usize) -> Result<CipherTensor> {
        let ids = tensor
            .ids
            .iter()
            .map(|&ct| self.bootstrap(ct, slots))
            .collect::<Result<Vec<_>>>()?;
        Ok(CipherTensor::new(
            ids,
            tensor.shape.clone(),
            tensor.on_shape.clone(),
        ))
    }
}
