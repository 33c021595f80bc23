//! Disk cache of compiled-layer inputs
//!
//! Each layer gets one directory under the cache root:
//!
//! ```text
//! <root>/<layer>/
//!   meta.bin                        bincode-encoded CacheMeta
//!   diagonals/<row>_<col>/<idx>.bin zstd-chunked diagonal (see `format`)
//!   plaintexts/                     reserved for the backend
//! ```
//!
//! An entry is written into `<root>/.<layer>.staging` and renamed into place
//! once complete, so readers see either the previous entry or the new one.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, MismatchedField, Result};
use crate::params::EmbeddingMethod;
use crate::tensor::Shape;

use super::format::{read_diagonal_file, write_diagonal_file};
use super::types::{
    validate_layer_name, BlockDiagonals, BlockIndex, Diagonals, LayerDescriptor, OutputRotations,
};

const META_FILE: &str = "meta.bin";
const DIAGONALS_DIR: &str = "diagonals";
const PLAINTEXTS_DIR: &str = "plaintexts";

/// Bumped whenever `CacheMeta` changes shape
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Diagonal indices stored for one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockManifest {
    pub block: BlockIndex,
    pub diagonals: Vec<i64>,
}

/// Everything stored for a layer apart from the diagonal payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub format_version: u32,
    pub layer: String,
    pub embedding_method: EmbeddingMethod,
    pub output_rotations: OutputRotations,
    pub on_bias: Vec<f64>,
    pub input_shape: Shape,
    pub output_shape: Shape,
    pub input_min: f64,
    pub input_max: f64,
    pub output_min: f64,
    pub output_max: f64,
    pub level: u32,
    pub bsgs_ratio: f64,
    pub blocks: Vec<BlockManifest>,
}

impl CacheMeta {
    fn from_layer(layer: &LayerDescriptor, embedding_method: EmbeddingMethod) -> Self {
        let blocks = layer
            .diagonals
            .iter()
            .map(|(&block, diags)| BlockManifest {
                block,
                diagonals: diags.keys().copied().collect(),
            })
            .collect();

        Self {
            format_version: CACHE_FORMAT_VERSION,
            layer: layer.name.clone(),
            embedding_method,
            output_rotations: layer.output_rotations.clone(),
            on_bias: layer.on_bias.clone(),
            input_shape: layer.input_shape.clone(),
            output_shape: layer.output_shape.clone(),
            input_min: layer.input_min,
            input_max: layer.input_max,
            output_min: layer.output_min,
            output_max: layer.output_max,
            level: layer.level,
            bsgs_ratio: layer.bsgs_ratio,
            blocks,
        }
    }

    pub fn diagonal_count(&self) -> usize {
        self.blocks.iter().map(|b| b.diagonals.len()).sum()
    }
}

/// Diagonals, bias and output rotations read back from the cache
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedTransforms {
    pub diagonals: BlockDiagonals,
    pub on_bias: Vec<f64>,
    pub output_rotations: OutputRotations,
}

/// `torch.allclose` semantics: |a - b| <= atol + rtol * |b|
fn allclose(current: &[f64], saved: &[f64]) -> bool {
    const RTOL: f64 = 1e-5;
    const ATOL: f64 = 1e-8;
    current
        .iter()
        .zip(saved)
        .all(|(a, b)| (a - b).abs() <= ATOL + RTOL * b.abs())
}

/// Fields of `saved` that disagree with the live layer, in check order
pub fn compare_layer(
    layer: &LayerDescriptor,
    embedding_method: EmbeddingMethod,
    saved: &CacheMeta,
) -> Vec<MismatchedField> {
    let mut mismatches = Vec::new();

    if layer.on_bias.len() != saved.on_bias.len() {
        mismatches.push(MismatchedField::BiasShape);
    } else if !allclose(&layer.on_bias, &saved.on_bias) {
        mismatches.push(MismatchedField::BiasValues);
    }

    if layer.output_rotations != saved.output_rotations {
        mismatches.push(MismatchedField::OutputRotations);
    }
    if layer.input_shape != saved.input_shape {
        mismatches.push(MismatchedField::InputShape);
    }
    if layer.output_shape != saved.output_shape {
        mismatches.push(MismatchedField::OutputShape);
    }
    if embedding_method != saved.embedding_method {
        mismatches.push(MismatchedField::EmbeddingMethod);
    }

    let ranges = [
        (layer.input_min, saved.input_min, MismatchedField::InputMin),
        (layer.input_max, saved.input_max, MismatchedField::InputMax),
        (layer.output_min, saved.output_min, MismatchedField::OutputMin),
        (layer.output_max, saved.output_max, MismatchedField::OutputMax),
    ];
    for (current, last, field) in ranges {
        if current != last {
            mismatches.push(field);
        }
    }

    mismatches
}

/// Handle on a cache root directory
#[derive(Debug, Clone)]
pub struct TransformCache {
    root: PathBuf,
}

impl TransformCache {
    /// The directory is created on first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layer_dir(&self, layer: &str) -> PathBuf {
        self.root.join(layer)
    }

    fn staging_dir(&self, layer: &str) -> PathBuf {
        self.root.join(format!(".{}.staging", layer))
    }

    fn retired_dir(&self, layer: &str) -> PathBuf {
        self.root.join(format!(".{}.old", layer))
    }

    pub fn contains(&self, layer: &str) -> bool {
        self.layer_dir(layer).is_dir()
    }

    /// Write a complete entry for `layer`, replacing any existing one.
    ///
    /// On success the layer's diagonal payloads are released; the block and
    /// index structure is kept. Reload before generating again.
    pub fn save_transforms(
        &self,
        layer: &mut LayerDescriptor,
        embedding_method: EmbeddingMethod,
    ) -> Result<()> {
        layer.validate()?;
        if !layer.has_diagonal_data() {
            return Err(Error::InvalidLayer(format!(
                "layer '{}' has no diagonal data to save (already saved?)",
                layer.name
            )));
        }

        fs::create_dir_all(&self.root)?;
        let staging = self.staging_dir(&layer.name);
        remove_if_exists(&staging)?;
        remove_if_exists(&self.retired_dir(&layer.name))?;

        if let Err(e) = self.write_entry(&staging, layer, embedding_method) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
        self.commit(&staging, &layer.name)?;

        info!(
            layer = %layer.name,
            blocks = layer.diagonals.len(),
            diagonals = layer.diagonal_count(),
            path = %self.layer_dir(&layer.name).display(),
            "saved layer transforms"
        );

        for data in layer.diagonals.values_mut().flat_map(|d| d.values_mut()) {
            *data = Vec::new();
        }
        Ok(())
    }

    fn write_entry(
        &self,
        dir: &Path,
        layer: &LayerDescriptor,
        embedding_method: EmbeddingMethod,
    ) -> Result<()> {
        let diags_dir = dir.join(DIAGONALS_DIR);
        fs::create_dir_all(&diags_dir)?;
        fs::create_dir_all(dir.join(PLAINTEXTS_DIR))?;

        let mut files = Vec::with_capacity(layer.diagonal_count());
        for (block, diags) in &layer.diagonals {
            let block_dir = diags_dir.join(block.to_string());
            fs::create_dir_all(&block_dir)?;
            for (idx, data) in diags {
                files.push((block_dir.join(format!("{}.bin", idx)), data.as_slice()));
            }
        }
        files
            .par_iter()
            .try_for_each(|(path, data)| write_diagonal_file(path, data))?;

        // metadata last: an entry without meta.bin is never complete
        let meta = CacheMeta::from_layer(layer, embedding_method);
        let mut writer = BufWriter::new(File::create(dir.join(META_FILE))?);
        bincode::serialize_into(&mut writer, &meta)?;
        writer.flush()?;
        Ok(())
    }

    fn commit(&self, staging: &Path, layer: &str) -> Result<()> {
        let target = self.layer_dir(layer);
        let retired = self.retired_dir(layer);
        let replacing = target.exists();
        if replacing {
            fs::rename(&target, &retired)?;
        }
        if let Err(e) = fs::rename(staging, &target) {
            if replacing {
                if let Err(restore) = fs::rename(&retired, &target) {
                    warn!(layer, error = %restore, "failed to restore previous cache entry");
                }
            }
            let _ = fs::remove_dir_all(staging);
            return Err(e.into());
        }
        remove_if_exists(&retired)?;
        Ok(())
    }

    /// Read the stored metadata of `layer`
    pub fn read_meta(&self, layer: &str) -> Result<CacheMeta> {
        validate_layer_name(layer)?;
        let dir = self.layer_dir(layer);
        if !dir.is_dir() {
            return Err(Error::CacheMissing {
                layer: layer.to_string(),
                path: self.root.clone(),
            });
        }

        let corrupt = |reason: String| Error::CacheCorrupt {
            layer: layer.to_string(),
            reason,
        };
        let file = File::open(dir.join(META_FILE))
            .map_err(|e| corrupt(format!("cannot open {}: {}", META_FILE, e)))?;
        let meta: CacheMeta = bincode::deserialize_from(BufReader::new(file))
            .map_err(|e| corrupt(format!("cannot decode {}: {}", META_FILE, e)))?;

        if meta.format_version != CACHE_FORMAT_VERSION {
            return Err(corrupt(format!(
                "format version {} (expected {})",
                meta.format_version, CACHE_FORMAT_VERSION
            )));
        }
        if meta.layer != layer {
            return Err(corrupt(format!("entry belongs to layer '{}'", meta.layer)));
        }
        Ok(meta)
    }

    /// Every field of the stored entry that disagrees with `layer`.
    ///
    /// Empty when the entry is compatible.
    pub fn compatibility_report(
        &self,
        layer: &LayerDescriptor,
        embedding_method: EmbeddingMethod,
    ) -> Result<Vec<MismatchedField>> {
        let saved = self.read_meta(&layer.name)?;
        Ok(compare_layer(layer, embedding_method, &saved))
    }

    pub fn verify_layer_compatibility(
        &self,
        layer: &LayerDescriptor,
        embedding_method: EmbeddingMethod,
    ) -> Result<()> {
        let fields = self.compatibility_report(layer, embedding_method)?;
        if !fields.is_empty() {
            return Err(Error::CacheIncompatible {
                layer: layer.name.clone(),
                fields,
            });
        }
        Ok(())
    }

    /// Verify the stored entry, then read back every diagonal block
    pub fn load_transforms(
        &self,
        layer: &LayerDescriptor,
        embedding_method: EmbeddingMethod,
    ) -> Result<LoadedTransforms> {
        let meta = self.read_meta(&layer.name)?;
        let fields = compare_layer(layer, embedding_method, &meta);
        if !fields.is_empty() {
            return Err(Error::CacheIncompatible {
                layer: layer.name.clone(),
                fields,
            });
        }

        let corrupt = |reason: String| Error::CacheCorrupt {
            layer: layer.name.clone(),
            reason,
        };

        let files = self.scan_diagonals(&layer.name).map_err(|e| {
            corrupt(format!("cannot list {}: {}", DIAGONALS_DIR, e))
        })?;

        let mut manifest: Vec<(BlockIndex, i64)> = meta
            .blocks
            .iter()
            .flat_map(|b| b.diagonals.iter().map(move |&idx| (b.block, idx)))
            .collect();
        manifest.sort_unstable();
        let found: Vec<(BlockIndex, i64)> = files.iter().map(|(b, i, _)| (*b, *i)).collect();
        if manifest != found {
            return Err(corrupt(format!(
                "{} diagonals on disk, {} listed in metadata",
                found.len(),
                manifest.len()
            )));
        }

        let decoded: Vec<(BlockIndex, i64, Vec<f64>)> = files
            .into_par_iter()
            .map(|(block, idx, path)| {
                read_diagonal_file(&path)
                    .map(|data| (block, idx, data))
                    .map_err(|e| corrupt(format!("diagonal {} of block {}: {}", idx, block, e)))
            })
            .collect::<Result<_>>()?;

        let mut diagonals = BlockDiagonals::new();
        for block in &meta.blocks {
            diagonals.insert(block.block, Diagonals::new());
        }
        for (block, idx, data) in decoded {
            diagonals.entry(block).or_default().insert(idx, data);
        }

        debug!(layer = %layer.name, blocks = diagonals.len(), "loaded layer transforms");
        Ok(LoadedTransforms {
            diagonals,
            on_bias: meta.on_bias,
            output_rotations: meta.output_rotations,
        })
    }

    /// `(block, diagonal index, path)` for every diagonal file of `layer`
    fn scan_diagonals(&self, layer: &str) -> io::Result<Vec<(BlockIndex, i64, PathBuf)>> {
        let bad_name = |name: &str| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected cache entry `{}`", name),
            )
        };

        let mut files = Vec::new();
        for block_entry in fs::read_dir(self.layer_dir(layer).join(DIAGONALS_DIR))? {
            let block_entry = block_entry?;
            let name = block_entry.file_name().to_string_lossy().into_owned();
            let block: BlockIndex = name.parse().map_err(|_| bad_name(&name))?;

            for diag_entry in fs::read_dir(block_entry.path())? {
                let diag_entry = diag_entry?;
                let file_name = diag_entry.file_name().to_string_lossy().into_owned();
                let idx: i64 = file_name
                    .strip_suffix(".bin")
                    .and_then(|stem| stem.parse().ok())
                    .ok_or_else(|| bad_name(&file_name))?;
                files.push((block, idx, diag_entry.path()));
            }
        }
        files.sort_by_key(|(b, i, _)| (*b, *i));
        Ok(files)
    }

    /// Names of all complete-looking entries, sorted
    pub fn list_layers(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut layers = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            layers.push(name);
        }
        layers.sort();
        Ok(layers)
    }

    /// Delete the entry for `layer`. Returns false if there was none.
    pub fn remove_layer(&self, layer: &str) -> Result<bool> {
        validate_layer_name(layer)?;
        let dir = self.layer_dir(layer);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        info!(layer, "removed cached layer");
        Ok(true)
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
