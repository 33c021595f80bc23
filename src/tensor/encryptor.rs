//! Element-wise encryption and decryption of tensor handles.

use crate::backend::{Backend, CiphertextId, PlaintextId};
use crate::error::{BackendContext, Result};

use super::{CipherTensor, PlainTensor};

/// Bridges plaintext and ciphertext tensors at the network boundary.
///
/// Position `i` of the output always corresponds to position `i` of the
/// input; shapes are carried over unchanged.
pub struct Encryptor<'a, B: Backend> {
    backend: &'a mut B,
}

impl<'a, B: Backend> Encryptor<'a, B> {
    pub fn new(backend: &'a mut B) -> Self {
        Self { backend }
    }

    pub fn encrypt(&mut self, plaintensor: &PlainTensor) -> Result<CipherTensor> {
        let ids = plaintensor
            .ids
            .iter()
            .map(|&pt| {
                self.backend
                    .encrypt(pt)
                    .with_op("Encrypt", || format!("plaintext={}", pt))
            })
            .collect::<Result<Vec<CiphertextId>>>()?;

        Ok(CipherTensor::new(
            ids,
            plaintensor.shape.clone(),
            plaintensor.on_shape.clone(),
        ))
    }

    pub fn decrypt(&mut self, ciphertensor: &CipherTensor) -> Result<PlainTensor> {
        let ids = ciphertensor
            .ids
            .iter()
            .map(|&ct| {
                self.backend
                    .decrypt(ct)
                    .with_op("Decrypt", || format!("ciphertext={}", ct))
            })
            .collect::<Result<Vec<PlaintextId>>>()?;

        Ok(PlainTensor::new(
            ids,
            ciphertensor.shape.clone(),
            ciphertensor.on_shape.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CleartextBackend;
    use crate::error::Error;
    use crate::tensor::Shape;

    fn encode_tiles(backend: &mut CleartextBackend, tiles: &[&[f64]]) -> PlainTensor {
        let ids = tiles
            .iter()
            .map(|t| backend.encode(t, 3).unwrap())
            .collect();
        PlainTensor::new(ids, Shape::from([6]), Shape::from([1, 6]))
    }

    #[test]
    fn test_encrypt_decrypt_preserves_order_and_shape() {
        let mut backend = CleartextBackend::new(2, 3);
        let pt = encode_tiles(&mut backend, &[&[1.0, 2.0], &[3.0, 4.0], &[5.0, 6.0]]);

        let mut enc = Encryptor::new(&mut backend);
        let ct = enc.encrypt(&pt).unwrap();
        assert_eq!(ct.len(), 3);
        assert_eq!(ct.shape, pt.shape);
        assert_eq!(ct.on_shape, pt.on_shape);

        let back = enc.decrypt(&ct).unwrap();
        assert_eq!(back.shape, pt.shape);
        assert_eq!(back.on_shape, pt.on_shape);

        let values: Vec<Vec<f64>> = back.ids.iter().map(|&id| backend.decode(id).unwrap()).collect();
        assert_eq!(values, vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]);
    }

    #[test]
    fn test_decrypt_encrypt_preserves_order_and_shape() {
        let mut backend = CleartextBackend::new(2, 3);
        let pt = encode_tiles(&mut backend, &[&[1.0, 2.0], &[3.0, 4.0], &[5.0, 6.0]]);

        // encrypt out of order so the tensor's ciphertext ids are not ascending
        let mut ids = vec![CiphertextId(0); 3];
        for i in [2, 0, 1] {
            ids[i] = backend.encrypt(pt.ids[i]).unwrap();
        }
        let ct = CipherTensor::new(ids, Shape::from([6]), Shape::from([1, 6]));
        assert!(ct.ids.windows(2).any(|w| w[0] > w[1]));

        let mut enc = Encryptor::new(&mut backend);
        let plain = enc.decrypt(&ct).unwrap();
        let again = enc.encrypt(&plain).unwrap();
        assert_eq!(plain.len(), 3);
        assert_eq!(plain.shape, ct.shape);
        assert_eq!(plain.on_shape, ct.on_shape);
        assert!(again.same_structure(&ct));

        let values: Vec<Vec<f64>> = again
            .ids
            .iter()
            .map(|&id| {
                let pt = backend.decrypt(id).unwrap();
                backend.decode(pt).unwrap()
            })
            .collect();
        assert_eq!(values, vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]);
    }

    #[test]
    fn test_encrypt_unknown_plaintext_fails() {
        let mut backend = CleartextBackend::new(2, 3);
        let pt = PlainTensor::new(vec![PlaintextId(42)], Shape::from([2]), Shape::from([2]));

        let err = Encryptor::new(&mut backend).encrypt(&pt).unwrap_err();
        match err {
            Error::BackendOperationFailed { op, args, .. } => {
                assert_eq!(op, "Encrypt");
                assert_eq!(args, "plaintext=42");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
