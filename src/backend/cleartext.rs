//! Cleartext implementation of the backend capability
//!
//! Ciphertexts are ordinary slot vectors tagged with a level. Linear
//! transforms are encoded into baby-step/giant-step form and evaluated with
//! real arithmetic, so results can be compared against a direct
//! matrix-vector product. Optional Gaussian noise mimics the approximation
//! error of CKKS.

use std::collections::HashMap;

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use tracing::debug;

use crate::lintrans::{BlockIndex, BsgsPlan, EncodedTransform};
use crate::params::StorageConfig;

use super::{
    backend_err, Backend, BackendError, BootstrapperId, CiphertextId, HandleAllocator,
    PlaintextId, TransformId, TransformRequest,
};

#[derive(Debug, Clone)]
struct Slots {
    values: Vec<f64>,
    level: u32,
}

#[derive(Debug)]
struct CompiledBlock {
    layer: String,
    block: BlockIndex,
    level: u32,
    plan: BsgsPlan,
    encoded: EncodedTransform,
}

#[derive(Debug)]
struct Bootstrapper {
    slots: usize,
    logp: Vec<u32>,
}

struct Noise {
    dist: Normal<f64>,
    rng: ChaCha20Rng,
}

/// Backend double performing unencrypted slot arithmetic
pub struct CleartextBackend {
    slots: usize,
    max_level: u32,
    plaintexts: HandleAllocator<Slots>,
    ciphertexts: HandleAllocator<Slots>,
    transforms: HandleAllocator<CompiledBlock>,
    bootstrappers: HandleAllocator<Bootstrapper>,
    bootstrapper_teardowns: usize,
    noise: Option<Noise>,
    failures: HashMap<&'static str, usize>,
}

impl CleartextBackend {
    /// Create a backend with `slots` slots per tile and levels `0..=max_level`
    pub fn new(slots: usize, max_level: u32) -> Self {
        Self {
            slots,
            max_level,
            plaintexts: HandleAllocator::new(),
            ciphertexts: HandleAllocator::new(),
            transforms: HandleAllocator::new(),
            bootstrappers: HandleAllocator::new(),
            bootstrapper_teardowns: 0,
            noise: None,
            failures: HashMap::new(),
        }
    }

    /// Add Gaussian noise with standard deviation `sigma` to every
    /// encryption, transform and bootstrap result
    pub fn with_noise(mut self, sigma: f64, seed: u64) -> Result<Self, BackendError> {
        let dist = Normal::new(0.0, sigma).map_err(|e| backend_err!("invalid noise: {}", e))?;
        self.noise = Some(Noise {
            dist,
            rng: ChaCha20Rng::seed_from_u64(seed),
        });
        Ok(self)
    }

    /// Let `op` succeed `successes` more times, then fail every call
    pub fn fail_after(&mut self, op: &'static str, successes: usize) {
        self.failures.insert(op, successes);
    }

    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    /// Encode `values` (zero-padded to a full tile) at `level`
    pub fn encode(&mut self, values: &[f64], level: u32) -> Result<PlaintextId, BackendError> {
        if values.len() > self.slots {
            return Err(backend_err!(
                "{} values do not fit in {} slots",
                values.len(),
                self.slots
            ));
        }
        if level > self.max_level {
            return Err(backend_err!("level {} above maximum {}", level, self.max_level));
        }
        let mut padded = values.to_vec();
        padded.resize(self.slots, 0.0);
        Ok(PlaintextId(self.plaintexts.add(Slots {
            values: padded,
            level,
        })))
    }

    pub fn decode(&self, plaintext: PlaintextId) -> Result<Vec<f64>, BackendError> {
        self.plaintexts
            .get(plaintext.0)
            .map(|pt| pt.values.clone())
            .ok_or_else(|| backend_err!("plaintext {} not found", plaintext))
    }

    pub fn level_of(&self, ciphertext: CiphertextId) -> Result<u32, BackendError> {
        Ok(self.ciphertext(ciphertext)?.level)
    }

    pub fn delete_ciphertext(&mut self, ciphertext: CiphertextId) {
        self.ciphertexts.remove(ciphertext.0);
    }

    pub fn delete_plaintext(&mut self, plaintext: PlaintextId) {
        self.plaintexts.remove(plaintext.0);
    }

    pub fn live_plaintexts(&self) -> usize {
        self.plaintexts.len()
    }

    pub fn live_ciphertexts(&self) -> usize {
        self.ciphertexts.len()
    }

    pub fn live_transforms(&self) -> usize {
        self.transforms.len()
    }

    pub fn live_bootstrappers(&self) -> usize {
        self.bootstrappers.len()
    }

    /// Key-switching moduli a live bootstrapper for `slots` was built with
    pub fn bootstrapper_logp(&self, slots: usize) -> Option<Vec<u32>> {
        self.bootstrappers
            .live_handles()
            .into_iter()
            .filter_map(|h| self.bootstrappers.get(h))
            .find(|b| b.slots == slots)
            .map(|b| b.logp.clone())
    }

    /// How many times `delete_bootstrappers` has been called
    pub fn bootstrapper_teardowns(&self) -> usize {
        self.bootstrapper_teardowns
    }

    /// Rotations needed by a compiled transform
    pub fn transform_rotations(&self, transform: TransformId) -> Result<Vec<usize>, BackendError> {
        let lt = self
            .transforms
            .get(transform.0)
            .ok_or_else(|| backend_err!("linear transform {} not found", transform))?;
        Ok(lt.plan.rotations().into_iter().collect())
    }

    fn check_failure(&mut self, op: &'static str) -> Result<(), BackendError> {
        if let Some(remaining) = self.failures.get_mut(op) {
            if *remaining == 0 {
                return Err(backend_err!("injected failure in {}", op));
            }
            *remaining -= 1;
        }
        Ok(())
    }

    fn ciphertext(&self, id: CiphertextId) -> Result<&Slots, BackendError> {
        self.ciphertexts
            .get(id.0)
            .ok_or_else(|| backend_err!("ciphertext {} not found", id))
    }

    fn perturb(&mut self, values: &mut [f64]) {
        if let Some(noise) = self.noise.as_mut() {
            for v in values.iter_mut() {
                *v += noise.dist.sample(&mut noise.rng);
            }
        }
    }
}

impl Backend for CleartextBackend {
    fn max_slots(&self) -> usize {
        self.slots
    }

    fn encrypt(&mut self, plaintext: PlaintextId) -> Result<CiphertextId, BackendError> {
        self.check_failure("Encrypt")?;
        let mut slots = self
            .plaintexts
            .get(plaintext.0)
            .cloned()
            .ok_or_else(|| backend_err!("plaintext {} not found", plaintext))?;
        self.perturb(&mut slots.values);
        Ok(CiphertextId(self.ciphertexts.add(slots)))
    }

    fn decrypt(&mut self, ciphertext: CiphertextId) -> Result<PlaintextId, BackendError> {
        self.check_failure("Decrypt")?;
        let slots = self.ciphertext(ciphertext)?.clone();
        Ok(PlaintextId(self.plaintexts.add(slots)))
    }

    fn generate_linear_transform(
        &mut self,
        request: &TransformRequest<'_>,
    ) -> Result<TransformId, BackendError> {
        self.check_failure("GenerateLinearTransform")?;
        let slots = self.slots;
        if request.diag_data.len() != request.diag_idxs.len() * slots {
            return Err(backend_err!(
                "expected {} diagonal values ({} diagonals x {} slots), got {}",
                request.diag_idxs.len() * slots,
                request.diag_idxs.len(),
                slots,
                request.diag_data.len()
            ));
        }
        if request.level > self.max_level {
            return Err(backend_err!(
                "level {} above maximum {}",
                request.level,
                self.max_level
            ));
        }

        let plan = BsgsPlan::new(request.diag_idxs, slots, request.bsgs_ratio)
            .map_err(|e| BackendError(e.to_string()))?;
        let diagonals = request
            .diag_idxs
            .iter()
            .copied()
            .zip(request.diag_data.chunks(slots));
        let encoded = plan
            .encode(diagonals)
            .map_err(|e| BackendError(e.to_string()))?;

        debug!(
            layer = request.layer_name,
            block = %request.block,
            n1 = plan.baby_step(),
            rotations = plan.rotations().len(),
            "encoded linear transform"
        );

        let id = self.transforms.add(CompiledBlock {
            layer: request.layer_name.to_string(),
            block: request.block,
            level: request.level,
            plan,
            encoded,
        });
        Ok(TransformId(id))
    }

    fn evaluate_linear_transforms(
        &mut self,
        transforms: &[TransformId],
        inputs: &[CiphertextId],
        layer_name: &str,
        _storage: StorageConfig<'_>,
    ) -> Result<Vec<CiphertextId>, BackendError> {
        self.check_failure("EvaluateLinearTransforms")?;
        let cols = inputs.len();
        if cols == 0 || transforms.is_empty() || transforms.len() % cols != 0 {
            return Err(backend_err!(
                "{} transforms cannot be tiled over {} input ciphertexts",
                transforms.len(),
                cols
            ));
        }
        let rows = transforms.len() / cols;

        let mut outputs = Vec::with_capacity(rows);
        for i in 0..rows {
            let mut acc = vec![0.0; self.slots];
            let mut level = u32::MAX;

            for (j, &input) in inputs.iter().enumerate() {
                let tid = transforms[i * cols + j];
                let lt = self
                    .transforms
                    .get(tid.0)
                    .ok_or_else(|| backend_err!("linear transform {} not found", tid))?;
                if lt.layer != layer_name {
                    return Err(backend_err!(
                        "linear transform {} belongs to layer '{}', not '{}'",
                        tid,
                        lt.layer,
                        layer_name
                    ));
                }
                if lt.block != BlockIndex::new(i, j) {
                    return Err(backend_err!(
                        "linear transform {} is block {}, evaluated as {}_{}",
                        tid,
                        lt.block,
                        i,
                        j
                    ));
                }

                let ct = self
                    .ciphertexts
                    .get(input.0)
                    .ok_or_else(|| backend_err!("ciphertext {} not found", input))?;
                if ct.level == 0 {
                    return Err(backend_err!(
                        "ciphertext {} has no level left for a linear transform",
                        input
                    ));
                }
                level = level.min(ct.level).min(lt.level);

                let partial = lt.encoded.apply(&ct.values);
                for (a, p) in acc.iter_mut().zip(partial) {
                    *a += p;
                }
            }

            // one rescale per output row
            let level = level.saturating_sub(1);
            self.perturb(&mut acc);
            outputs.push(CiphertextId(self.ciphertexts.add(Slots { values: acc, level })));
        }
        Ok(outputs)
    }

    fn delete_linear_transform(&mut self, transform: TransformId) -> Result<(), BackendError> {
        self.check_failure("DeleteLinearTransform")?;
        self.transforms.remove(transform.0);
        Ok(())
    }

    fn new_bootstrapper(
        &mut self,
        logp: &[u32],
        slots: usize,
    ) -> Result<BootstrapperId, BackendError> {
        self.check_failure("NewBootstrapper")?;
        if slots == 0 || slots > self.slots || !slots.is_power_of_two() {
            return Err(backend_err!(
                "cannot bootstrap {} slots with a ring of {} slots",
                slots,
                self.slots
            ));
        }
        let id = self.bootstrappers.add(Bootstrapper {
            slots,
            logp: logp.to_vec(),
        });
        Ok(BootstrapperId(id))
    }

    fn bootstrap(
        &mut self,
        ciphertext: CiphertextId,
        slots: usize,
    ) -> Result<CiphertextId, BackendError> {
        self.check_failure("Bootstrap")?;
        if self.bootstrapper_logp(slots).is_none() {
            return Err(backend_err!("no bootstrapper for {} slots", slots));
        }

        let mut refreshed = self.ciphertext(ciphertext)?.clone();
        refreshed.level = self.max_level;
        self.perturb(&mut refreshed.values);
        Ok(CiphertextId(self.ciphertexts.add(refreshed)))
    }

    fn delete_bootstrappers(&mut self) -> Result<(), BackendError> {
        self.check_failure("DeleteBootstrappers")?;
        self.bootstrappers.reset();
        self.bootstrapper_teardowns += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::IoMode;
    use std::path::Path;

    fn storage() -> StorageConfig<'static> {
        StorageConfig {
            diags_path: Path::new(""),
            keys_path: Path::new(""),
            io_mode: IoMode::None,
        }
    }

    fn request<'a>(idxs: &'a [i64], data: &'a [f64], row: usize, col: usize) -> TransformRequest<'a> {
        TransformRequest {
            diag_idxs: idxs,
            diag_data: data,
            level: 3,
            bsgs_ratio: 2.0,
            block: BlockIndex::new(row, col),
            layer_name: "fc",
            storage: storage(),
        }
    }

    fn encrypt(backend: &mut CleartextBackend, values: &[f64], level: u32) -> CiphertextId {
        let pt = backend.encode(values, level).unwrap();
        backend.encrypt(pt).unwrap()
    }

    fn decrypt(backend: &mut CleartextBackend, ct: CiphertextId) -> Vec<f64> {
        let pt = backend.decrypt(ct).unwrap();
        backend.decode(pt).unwrap()
    }

    #[test]
    fn test_single_block_transform() {
        let mut backend = CleartextBackend::new(4, 3);
        // [[0,1,0,0],[0,0,1,0],[0,0,0,1],[1,0,0,0]]: a single rotation diagonal
        let lt = backend
            .generate_linear_transform(&request(&[1], &[1.0; 4], 0, 0))
            .unwrap();
        let ct = encrypt(&mut backend, &[1.0, 2.0, 3.0, 4.0], 3);

        let out = backend
            .evaluate_linear_transforms(&[lt], &[ct], "fc", storage())
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(decrypt(&mut backend, out[0]), vec![2.0, 3.0, 4.0, 1.0]);
        assert_eq!(backend.level_of(out[0]).unwrap(), 2);
    }

    #[test]
    fn test_blocked_transform_accumulates_columns() {
        let mut backend = CleartextBackend::new(2, 3);
        let t00 = backend.generate_linear_transform(&request(&[0], &[1.0, 2.0], 0, 0)).unwrap();
        let t01 = backend.generate_linear_transform(&request(&[1], &[3.0, 4.0], 0, 1)).unwrap();
        let t10 = backend.generate_linear_transform(&request(&[0], &[5.0, 6.0], 1, 0)).unwrap();
        let t11 = backend.generate_linear_transform(&request(&[1], &[7.0, 8.0], 1, 1)).unwrap();

        let x0 = encrypt(&mut backend, &[1.0, 1.0], 3);
        let x1 = encrypt(&mut backend, &[1.0, 2.0], 3);

        let out = backend
            .evaluate_linear_transforms(&[t00, t01, t10, t11], &[x0, x1], "fc", storage())
            .unwrap();
        assert_eq!(out.len(), 2);
        // row 0: [1,2]*[1,1] + [3,4]*rot1([1,2]) = [1+6, 2+4]
        assert_eq!(decrypt(&mut backend, out[0]), vec![7.0, 6.0]);
        // row 1: [5,6]*[1,1] + [7,8]*[2,1]
        assert_eq!(decrypt(&mut backend, out[1]), vec![19.0, 14.0]);
    }

    #[test]
    fn test_evaluation_rejects_misordered_blocks() {
        let mut backend = CleartextBackend::new(2, 3);
        let t00 = backend.generate_linear_transform(&request(&[0], &[1.0, 2.0], 0, 0)).unwrap();
        let t01 = backend.generate_linear_transform(&request(&[1], &[3.0, 4.0], 0, 1)).unwrap();
        let x0 = encrypt(&mut backend, &[1.0, 1.0], 3);
        let x1 = encrypt(&mut backend, &[1.0, 2.0], 3);

        assert!(backend
            .evaluate_linear_transforms(&[t01, t00], &[x0, x1], "fc", storage())
            .is_err());
        assert!(backend
            .evaluate_linear_transforms(&[t00, t01], &[x0], "fc", storage())
            .is_err());
    }

    #[test]
    fn test_wrong_data_length_rejected() {
        let mut backend = CleartextBackend::new(4, 3);
        let err = backend
            .generate_linear_transform(&request(&[0, 1], &[1.0; 4], 0, 0))
            .unwrap_err();
        assert!(err.0.contains("expected 8 diagonal values"));
        assert_eq!(backend.live_transforms(), 0);
    }

    #[test]
    fn test_level_exhaustion_and_bootstrap() {
        let mut backend = CleartextBackend::new(2, 3);
        let lt = backend.generate_linear_transform(&request(&[0], &[1.0, 1.0], 0, 0)).unwrap();
        let ct = encrypt(&mut backend, &[1.0, 2.0], 0);

        assert!(backend
            .evaluate_linear_transforms(&[lt], &[ct], "fc", storage())
            .is_err());

        assert!(backend.bootstrap(ct, 2).is_err());
        backend.new_bootstrapper(&[61, 61], 2).unwrap();
        assert_eq!(backend.bootstrapper_logp(2), Some(vec![61, 61]));
        let refreshed = backend.bootstrap(ct, 2).unwrap();
        assert_eq!(backend.level_of(refreshed).unwrap(), 3);
        assert_eq!(decrypt(&mut backend, refreshed), vec![1.0, 2.0]);

        backend.delete_bootstrappers().unwrap();
        assert_eq!(backend.live_bootstrappers(), 0);
        assert_eq!(backend.bootstrapper_teardowns(), 1);
    }

    #[test]
    fn test_noise_is_small() {
        let mut backend = CleartextBackend::new(4, 3).with_noise(1e-6, 1).unwrap();
        let ct = encrypt(&mut backend, &[1.0, 2.0, 3.0, 4.0], 3);
        let values = decrypt(&mut backend, ct);
        for (v, e) in values.iter().zip([1.0, 2.0, 3.0, 4.0]) {
            assert!((v - e).abs() < 1e-4);
        }
    }

    #[test]
    fn test_injected_failure() {
        let mut backend = CleartextBackend::new(2, 3);
        backend.fail_after("GenerateLinearTransform", 1);
        assert!(backend.generate_linear_transform(&request(&[0], &[1.0, 1.0], 0, 0)).is_ok());
        assert!(backend.generate_linear_transform(&request(&[0], &[1.0, 1.0], 0, 1)).is_err());
    }

    #[test]
    fn test_handles_released_and_reused() {
        let mut backend = CleartextBackend::new(16, 3);
        assert_eq!(backend.max_level(), 3);
        let idxs: Vec<i64> = (0..16).collect();
        let data = vec![1.0; 16 * 16];
        let lt = backend.generate_linear_transform(&request(&idxs, &data, 0, 0)).unwrap();
        let rotations = backend.transform_rotations(lt).unwrap();
        assert!(!rotations.is_empty() && rotations.len() < 15);

        let a = encrypt(&mut backend, &[1.0], 3);
        let b = encrypt(&mut backend, &[2.0], 3);
        assert_eq!(backend.live_ciphertexts(), 2);
        backend.delete_ciphertext(a);
        assert!(backend.level_of(a).is_err());
        assert_eq!(encrypt(&mut backend, &[3.0], 3), a);
        assert_ne!(a, b);

        // both encodes above are still held as plaintexts
        assert_eq!(backend.live_plaintexts(), 3);
        backend.delete_plaintext(PlaintextId(0));
        assert_eq!(backend.live_plaintexts(), 2);
    }
}
