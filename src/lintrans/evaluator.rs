//! Layer-level driver for compiling, caching and evaluating transforms

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::backend::{Backend, TransformId};
use crate::error::{BackendContext, Error, Result};
use crate::params::{IoMode, SchemeParams};
use crate::tensor::CipherTensor;
use crate::timing::{PhaseRecord, PhaseTimer};

use super::cache::{LoadedTransforms, TransformCache};
use super::compiler;
use super::types::{BlockIndex, LayerDescriptor};

/// Compiles layers against a backend and applies them to ciphertexts.
///
/// Borrows the backend mutably for its whole lifetime, so no other component
/// can touch transform ids while an evaluator is alive.
pub struct LinearTransformEvaluator<'a, B: Backend> {
    backend: &'a mut B,
    params: &'a SchemeParams,
    cache: TransformCache,
}

impl<'a, B: Backend> LinearTransformEvaluator<'a, B> {
    pub fn new(backend: &'a mut B, params: &'a SchemeParams) -> Self {
        Self {
            backend,
            params,
            cache: TransformCache::new(params.diags_path.clone()),
        }
    }

    pub fn cache(&self) -> &TransformCache {
        &self.cache
    }

    /// One compiled transform per block of `layer`.
    ///
    /// The ids are returned, not stored; see [`compile_layer`](Self::compile_layer).
    pub fn generate_transforms(
        &mut self,
        layer: &LayerDescriptor,
    ) -> Result<BTreeMap<BlockIndex, TransformId>> {
        compiler::generate_transforms(&mut *self.backend, layer, self.params.storage())
    }

    /// Persist `layer` and release its diagonal payloads.
    pub fn save_transforms(&self, layer: &mut LayerDescriptor) -> Result<()> {
        self.cache.save_transforms(layer, self.params.embedding_method)
    }

    pub fn load_transforms(&self, layer: &LayerDescriptor) -> Result<LoadedTransforms> {
        self.cache.load_transforms(layer, self.params.embedding_method)
    }

    pub fn verify_layer_compatibility(&self, layer: &LayerDescriptor) -> Result<()> {
        self.cache
            .verify_layer_compatibility(layer, self.params.embedding_method)
    }

    /// Apply the compiled `layer` to `input`.
    ///
    /// The output has `layer.output_shape` as its logical shape and
    /// `layer.fhe_output_shape` as its packed shape.
    pub fn evaluate_transforms(
        &mut self,
        layer: &LayerDescriptor,
        input: &CipherTensor,
    ) -> Result<CipherTensor> {
        if !layer.is_compiled() {
            return Err(Error::InvalidLayer(format!(
                "layer '{}' has not been compiled",
                layer.name
            )));
        }

        let (rows, cols) = layer.block_grid();
        if input.len() != cols {
            return Err(Error::TileCountMismatch {
                what: format!("input to layer '{}'", layer.name),
                expected: cols,
                actual: input.len(),
            });
        }
        // the backend returns one ciphertext per block row; reject before
        // any output is created
        let expected_out = layer.fhe_output_shape.tile_count(self.backend.max_slots());
        if rows != expected_out {
            return Err(Error::TileCountMismatch {
                what: format!(
                    "output of layer '{}' with packed shape {}",
                    layer.name, layer.fhe_output_shape
                ),
                expected: expected_out,
                actual: rows,
            });
        }

        // ascending (row, col), which the backend folds back into a grid
        let transform_ids: Vec<TransformId> = layer.transform_ids.values().copied().collect();
        let out_ids = self
            .backend
            .evaluate_linear_transforms(
                &transform_ids,
                &input.ids,
                &layer.name,
                self.params.storage(),
            )
            .with_op("EvaluateLinearTransforms", || {
                format!(
                    "transforms={:?}, inputs={:?}, layer={}",
                    transform_ids.iter().map(|t| t.0).collect::<Vec<_>>(),
                    input.ids.iter().map(|c| c.0).collect::<Vec<_>>(),
                    layer.name
                )
            })?;

        let output = CipherTensor::new(
            out_ids,
            layer.output_shape.clone(),
            layer.fhe_output_shape.clone(),
        );
        output.check_tiles(self.backend.max_slots())?;

        debug!(
            layer = %layer.name,
            inputs = input.len(),
            outputs = output.len(),
            "evaluated linear transforms"
        );
        Ok(output)
    }

    /// Release the layer's compiled transforms
    pub fn delete_transforms(&mut self, layer: &mut LayerDescriptor) -> Result<()> {
        compiler::delete_transforms(&mut *self.backend, &mut layer.transform_ids)
    }

    /// Run the compile lifecycle for `layer` under the configured IO mode.
    ///
    /// - `save`: save, reload (verifying and refilling the diagonals), generate
    /// - `load`: load, generate
    /// - `none`: generate
    ///
    /// The resulting ids are stored in `layer.transform_ids`. Returns the
    /// phase timings.
    pub fn compile_layer(&mut self, layer: &mut LayerDescriptor) -> Result<Vec<PhaseRecord>> {
        if layer.is_compiled() {
            return Err(Error::InvalidLayer(format!(
                "layer '{}' is already compiled; delete its transforms first",
                layer.name
            )));
        }

        let embedding = self.params.embedding_method;
        let mut timer = PhaseTimer::new();

        if self.params.io_mode == IoMode::Save {
            timer.time("save", || self.cache.save_transforms(layer, embedding))?;
        }
        if self.params.io_mode.uses_disk() {
            let loaded = timer.time("load", || self.cache.load_transforms(layer, embedding))?;
            layer.diagonals = loaded.diagonals;
        }

        let storage = self.params.storage();
        let backend = &mut *self.backend;
        let ids = timer.time("generate", || {
            compiler::generate_transforms(backend, layer, storage)
        })?;
        layer.transform_ids = ids;

        info!(
            layer = %layer.name,
            io_mode = %self.params.io_mode,
            blocks = layer.transform_ids.len(),
            elapsed_ms = timer.total_ms(),
            "compiled layer"
        );
        Ok(timer.into_records())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CleartextBackend;
    use crate::lintrans::BlockDiagonals;
    use crate::tensor::{Encryptor, PlainTensor, Shape};
    use tempfile::tempdir;

    fn params(io_mode: IoMode, dir: &std::path::Path) -> SchemeParams {
        SchemeParams {
            log_n: 3,
            log_q: vec![20, 20, 20, 20],
            log_p: vec![20],
            log_scale: 20,
            io_mode,
            diags_path: dir.join("diagonals"),
            ..SchemeParams::toy()
        }
    }

    fn layer() -> LayerDescriptor {
        // 4x4 permutation-plus-scale matrix, single block
        let mut diags = BlockDiagonals::new();
        diags.insert(
            BlockIndex::new(0, 0),
            [(0, vec![2.0; 4]), (1, vec![1.0, 0.0, 0.0, 0.0])]
                .into_iter()
                .collect(),
        );
        LayerDescriptor::new("fc", diags, 3, 2.0).with_shapes(
            Shape::from([4]),
            Shape::from([4]),
            Shape::from([1, 4]),
        )
    }

    fn encrypt(backend: &mut CleartextBackend, values: &[f64]) -> CipherTensor {
        let pt = backend.encode(values, 3).unwrap();
        let plain = PlainTensor::new(vec![pt], Shape::from([4]), Shape::from([1, 4]));
        Encryptor::new(backend).encrypt(&plain).unwrap()
    }

    #[test]
    fn test_compile_without_disk() {
        let dir = tempdir().unwrap();
        let params = params(IoMode::None, dir.path());
        let mut backend = CleartextBackend::new(4, 3);
        let mut layer = layer();

        let mut eval = LinearTransformEvaluator::new(&mut backend, &params);
        let phases = eval.compile_layer(&mut layer).unwrap();
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].name, "generate");
        assert_eq!(layer.transform_ids.len(), 1);
        assert!(!params.diags_path.exists());
        assert!(eval.compile_layer(&mut layer).is_err());
    }

    #[test]
    fn test_save_mode_keeps_diagonals_usable() {
        let dir = tempdir().unwrap();
        let params = params(IoMode::Save, dir.path());
        let mut backend = CleartextBackend::new(4, 3);
        let mut layer = layer();
        let original = layer.diagonals.clone();

        let mut eval = LinearTransformEvaluator::new(&mut backend, &params);
        let phases = eval.compile_layer(&mut layer).unwrap();
        let names: Vec<&str> = phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["save", "load", "generate"]);
        assert_eq!(layer.diagonals, original);
        assert!(eval.cache().contains("fc"));
    }

    #[test]
    fn test_evaluate_matches_matrix() {
        let dir = tempdir().unwrap();
        let params = params(IoMode::None, dir.path());
        let mut backend = CleartextBackend::new(4, 3);
        let mut layer = layer();
        let input = encrypt(&mut backend, &[1.0, 2.0, 3.0, 4.0]);

        let mut eval = LinearTransformEvaluator::new(&mut backend, &params);
        eval.compile_layer(&mut layer).unwrap();
        let out = eval.evaluate_transforms(&layer, &input).unwrap();
        assert_eq!(out.shape, Shape::from([4]));
        assert_eq!(out.on_shape, Shape::from([1, 4]));
        eval.delete_transforms(&mut layer).unwrap();
        assert!(layer.transform_ids.is_empty());
        drop(eval);

        let pt = backend.decrypt(out.ids[0]).unwrap();
        // y = 2x + e_0 * x_1
        assert_eq!(backend.decode(pt).unwrap(), vec![4.0, 4.0, 6.0, 8.0]);
        assert_eq!(backend.live_transforms(), 0);
    }

    #[test]
    fn test_evaluate_rejects_wrong_tile_counts() {
        let dir = tempdir().unwrap();
        let params = params(IoMode::None, dir.path());
        let mut backend = CleartextBackend::new(4, 3);
        let mut layer = layer();
        let input = encrypt(&mut backend, &[1.0, 2.0, 3.0, 4.0]);

        let mut eval = LinearTransformEvaluator::new(&mut backend, &params);
        assert!(matches!(
            eval.evaluate_transforms(&layer, &input),
            Err(Error::InvalidLayer(_))
        ));

        eval.compile_layer(&mut layer).unwrap();
        let mut doubled = input.clone();
        doubled.ids.push(input.ids[0]);
        assert!(matches!(
            eval.evaluate_transforms(&layer, &doubled),
            Err(Error::TileCountMismatch { expected: 1, actual: 2, .. })
        ));

        layer.fhe_output_shape = Shape::from([2, 4]);
        assert!(matches!(
            eval.evaluate_transforms(&layer, &input),
            Err(Error::TileCountMismatch { expected: 2, actual: 1, .. })
        ));
    }

    #[test]
    fn test_output_shape_mismatch_creates_no_ciphertexts() {
        let dir = tempdir().unwrap();
        let params = params(IoMode::None, dir.path());
        let mut backend = CleartextBackend::new(4, 3);
        let mut layer = layer();
        let input = encrypt(&mut backend, &[1.0, 2.0, 3.0, 4.0]);
        let live_before = backend.live_ciphertexts();

        let mut eval = LinearTransformEvaluator::new(&mut backend, &params);
        eval.compile_layer(&mut layer).unwrap();
        layer.fhe_output_shape = Shape::from([2, 4]);
        assert!(matches!(
            eval.evaluate_transforms(&layer, &input),
            Err(Error::TileCountMismatch { .. })
        ));
        drop(eval);
        assert_eq!(backend.live_ciphertexts(), live_before);
    }

    #[test]
    fn test_load_mode_requires_saved_entry() {
        let dir = tempdir().unwrap();
        let params = params(IoMode::Load, dir.path());
        let mut backend = CleartextBackend::new(4, 3);
        let mut layer = layer();

        let mut eval = LinearTransformEvaluator::new(&mut backend, &params);
        let err = eval.compile_layer(&mut layer).unwrap_err();
        assert!(matches!(err, Error::CacheMissing { .. }));
        assert!(!layer.is_compiled());
        drop(eval);
        assert_eq!(backend.live_transforms(), 0);
    }
}
