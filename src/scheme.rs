//! Scheme: backend, parameters and bootstrappers under one owner

use tracing::{info, warn};

use crate::backend::Backend;
use crate::bootstrap::{BootstrapContext, Bootstrapper};
use crate::error::{Error, Result};
use crate::lintrans::LinearTransformEvaluator;
use crate::params::SchemeParams;
use crate::tensor::Encryptor;

/// Owns a backend for the lifetime of a network.
///
/// Components are borrowed views, handed out one at a time. Bootstrappers are
/// released by [`close`](Self::close) or, failing that, on drop.
pub struct Scheme<B: Backend> {
    backend: B,
    params: SchemeParams,
    bootstrap: BootstrapContext,
    closed: bool,
}

impl<B: Backend> Scheme<B> {
    pub fn new(backend: B, params: SchemeParams) -> Result<Self> {
        params.validate()?;
        if backend.max_slots() != params.max_slots() {
            return Err(Error::InvalidParams(format!(
                "backend exposes {} slots but log_n = {} implies {}",
                backend.max_slots(),
                params.log_n,
                params.max_slots()
            )));
        }
        info!(
            log_n = params.log_n,
            slots = params.max_slots(),
            io_mode = %params.io_mode,
            embedding = %params.embedding_method,
            "scheme initialized"
        );
        Ok(Self {
            backend,
            params,
            bootstrap: BootstrapContext::new(),
            closed: false,
        })
    }

    pub fn params(&self) -> &SchemeParams {
        &self.params
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn bootstrap_context(&self) -> &BootstrapContext {
        &self.bootstrap
    }

    pub fn encryptor(&mut self) -> Encryptor<'_, B> {
        Encryptor::new(&mut self.backend)
    }

    pub fn lt_evaluator(&mut self) -> LinearTransformEvaluator<'_, B> {
        LinearTransformEvaluator::new(&mut self.backend, &self.params)
    }

    pub fn bootstrapper(&mut self) -> Bootstrapper<'_, B> {
        Bootstrapper::new(&mut self.backend, &self.params, &mut self.bootstrap)
    }

    /// Release every bootstrapper. Dropping the scheme does the same, but
    /// can only log a failure.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.bootstrap.release(&mut self.backend)
    }
}

impl<B: Backend> Drop for Scheme<B> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.bootstrap.release(&mut self.backend) {
            warn!(error = %e, "failed to release bootstrappers");
        }
    }
}
