//! Per-block compilation of a layer into backend transforms

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::backend::{Backend, TransformId, TransformRequest};
use crate::error::{BackendContext, Result};
use crate::params::StorageConfig;

use super::types::{BlockIndex, Diagonals, LayerDescriptor};

/// Flatten a block into parallel index and data sequences.
///
/// `data` is the concatenation of the diagonals in index order, so diagonal
/// `indices[k]` occupies `data[k * len .. (k + 1) * len]`.
pub fn flatten_block(diags: &Diagonals) -> (Vec<i64>, Vec<f64>) {
    let total = diags.values().map(|d| d.len()).sum();
    let mut indices = Vec::with_capacity(diags.len());
    let mut data = Vec::with_capacity(total);
    for (&idx, diag) in diags {
        indices.push(idx);
        data.extend_from_slice(diag);
    }
    (indices, data)
}

/// Compile every block of `layer`, in ascending `(row, col)` order.
///
/// Either every block compiles or none stays alive: on failure the
/// transforms created so far are deleted before the error is returned.
pub fn generate_transforms<B: Backend>(
    backend: &mut B,
    layer: &LayerDescriptor,
    storage: StorageConfig<'_>,
) -> Result<BTreeMap<BlockIndex, TransformId>> {
    layer.validate()?;

    let mut ids = BTreeMap::new();
    for (&block, diags) in &layer.diagonals {
        let (diag_idxs, diag_data) = flatten_block(diags);
        let request = TransformRequest {
            diag_idxs: &diag_idxs,
            diag_data: &diag_data,
            level: layer.level,
            bsgs_ratio: layer.bsgs_ratio,
            block,
            layer_name: &layer.name,
            storage,
        };

        match backend
            .generate_linear_transform(&request)
            .with_op("GenerateLinearTransform", || request.to_string())
        {
            Ok(id) => {
                debug!(layer = %layer.name, %block, transform = %id, "generated transform");
                ids.insert(block, id);
            }
            Err(e) => {
                release(backend, &layer.name, &ids);
                return Err(e);
            }
        }
    }
    Ok(ids)
}

/// Best-effort cleanup after a partial compile; the original error wins.
fn release<B: Backend>(backend: &mut B, layer: &str, ids: &BTreeMap<BlockIndex, TransformId>) {
    for (block, &id) in ids {
        if let Err(e) = backend.delete_linear_transform(id) {
            warn!(layer, %block, transform = %id, error = %e, "failed to release transform");
        }
    }
}

/// Release every transform in `ids`, removing each entry once deleted.
///
/// On failure `ids` holds exactly the transforms that are still alive.
pub fn delete_transforms<B: Backend>(
    backend: &mut B,
    ids: &mut BTreeMap<BlockIndex, TransformId>,
) -> Result<()> {
    while let Some((&block, &id)) = ids.first_key_value() {
        backend
            .delete_linear_transform(id)
            .with_op("DeleteLinearTransform", || format!("block={}, transform={}", block, id))?;
        ids.remove(&block);
    }
    Ok(())
}
