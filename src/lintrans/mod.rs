//! Linear layers as homomorphic linear transforms
//!
//! A linear layer arrives as a grid of blocks, each block a set of
//! generalized diagonals over one tile of slots. The pipeline is:
//!
//! 1. **Compile**: one backend transform per block ([`generate_transforms`])
//! 2. **Cache**: persist the diagonals plus the metadata needed to detect a
//!    stale entry ([`TransformCache`])
//! 3. **Evaluate**: apply all blocks to a tiled ciphertext in one backend
//!    call ([`LinearTransformEvaluator::evaluate_transforms`])
//! 4. **Release**: delete every compiled transform ([`delete_transforms`])
//!
//! [`BsgsPlan`] describes how a block is evaluated with a baby-step/giant-step
//! rotation schedule.

mod bsgs;
mod cache;
mod compiler;
mod evaluator;
mod format;
mod types;

pub use bsgs::{apply_diagonals, log_ratio_bound, rotate, BsgsPlan, EncodedTransform};
pub use cache::{
    compare_layer, BlockManifest, CacheMeta, LoadedTransforms, TransformCache,
    CACHE_FORMAT_VERSION,
};
pub use compiler::{delete_transforms, flatten_block, generate_transforms};
pub use evaluator::LinearTransformEvaluator;
pub use types::{BlockDiagonals, BlockIndex, Diagonals, LayerDescriptor, OutputRotations};
