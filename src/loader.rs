//! Safetensors weight loading and the on-disk layout of a pyramid-flow checkpoint.
//!
//! - Sharded models are detected through `model.safetensors.index.json`
//! - Single `model.safetensors` or `diffusion_pytorch_model.safetensors` files
//! - Fallback scan for any `.safetensors` in the directory
//! - JSON config parsing for the submodule configs

use crate::config::{Architecture, ResolutionVariant};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Failed to read file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON config: {path}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing shard files: {missing:?}")]
    MissingShards { missing: Vec<String> },

    #[error("No safetensors files found in directory: {path}")]
    NoSafetensorsFound { path: String },

    #[error("Checkpoint at {root} has no {component} directory ({expected})")]
    MissingComponent {
        root: String,
        component: &'static str,
        expected: String,
    },

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

// =============================================================================
// Safetensors Index (model.safetensors.index.json)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetensorsIndex {
    /// Maps tensor names to their shard file names
    pub weight_map: HashMap<String, String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl SafetensorsIndex {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoaderError> {
        load_model_config(path)
    }

    /// Unique shard files, sorted.
    pub fn shard_files(&self) -> Vec<String> {
        self.weight_map
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

const INDEX_NAMES: [&str; 2] = [
    "model.safetensors.index.json",
    "diffusion_pytorch_model.safetensors.index.json",
];

const SINGLE_NAMES: [&str; 2] = ["model.safetensors", "diffusion_pytorch_model.safetensors"];

/// Weight files of a component directory, shards in index order.
pub fn resolve_weight_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, LoaderError> {
    let dir = dir.as_ref();

    for index_name in INDEX_NAMES {
        let index_path = dir.join(index_name);
        if !index_path.exists() {
            continue;
        }
        let index = SafetensorsIndex::load(&index_path)?;
        let (present, missing): (Vec<_>, Vec<_>) = index
            .shard_files()
            .into_iter()
            .partition(|shard| dir.join(shard).exists());
        if !missing.is_empty() {
            return Err(LoaderError::MissingShards { missing });
        }
        return Ok(present.into_iter().map(|s| dir.join(s)).collect());
    }

    for single in SINGLE_NAMES {
        let path = dir.join(single);
        if path.exists() {
            return Ok(vec![path]);
        }
    }

    let files = find_safetensors(dir)?;
    if files.is_empty() {
        return Err(LoaderError::NoSafetensorsFound {
            path: dir.display().to_string(),
        });
    }
    Ok(files)
}

/// All `.safetensors` files in `dir`, sorted by name.
pub fn find_safetensors(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, LoaderError> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir).map_err(|e| LoaderError::FileRead {
        path: dir.display().to_string(),
        source: e,
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| LoaderError::FileRead {
                path: dir.display().to_string(),
                source: e,
            })?
            .path();
        if path.extension().is_some_and(|ext| ext == "safetensors") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Memory-map weight files into a var builder on `device`.
pub fn mmap_var_builder(files: &[PathBuf], dtype: DType, device: &Device) -> Result<VarBuilder<'static>, LoaderError> {
    // SAFETY: the checkpoint files are not modified while mapped.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(files, dtype, device)? };
    Ok(vb)
}

/// Load a JSON configuration file and deserialize it.
pub fn load_model_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, LoaderError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| LoaderError::FileRead {
        path: path.display().to_string(),
        source: e,
    })?;

    serde_json::from_str(&content).map_err(|e| LoaderError::JsonParse {
        path: path.display().to_string(),
        source: e,
    })
}

// =============================================================================
// Checkpoint layout
// =============================================================================

/// Text encoder tower kinds found in a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TowerKind {
    /// CLIP ViT-L/14 text tower (768)
    ClipL,
    /// OpenCLIP bigG text tower (1280)
    ClipG,
    /// T5 v1.1 XXL encoder (4096)
    T5Xxl,
}

/// One text tower: weights directory and tokenizer directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TowerDirs {
    pub kind: TowerKind,
    pub weights: PathBuf,
    pub tokenizer: PathBuf,
}

/// Component directories of a checkpoint for one architecture and variant.
#[derive(Debug, Clone)]
pub struct ModelLayout {
    pub root: PathBuf,
    pub architecture: Architecture,
    pub variant: ResolutionVariant,
    pub transformer: PathBuf,
    pub vae: PathBuf,
    /// CLIP towers contributing the pooled embedding, in concatenation order
    pub clip_towers: Vec<TowerDirs>,
    /// T5 tower producing the sequence embedding
    pub t5: TowerDirs,
}

impl ModelLayout {
    /// Expected directory names, without touching the filesystem.
    pub fn expected(root: impl Into<PathBuf>, architecture: Architecture, variant: ResolutionVariant) -> Self {
        let root = root.into();
        let tower = |kind, weights: &str, tokenizer: &str| TowerDirs {
            kind,
            weights: root.join(weights),
            tokenizer: root.join(tokenizer),
        };
        let (clip_towers, t5) = match architecture {
            Architecture::PyramidMmDit => (
                vec![
                    tower(TowerKind::ClipL, "text_encoder", "tokenizer"),
                    tower(TowerKind::ClipG, "text_encoder_2", "tokenizer_2"),
                ],
                tower(TowerKind::T5Xxl, "text_encoder_3", "tokenizer_3"),
            ),
            Architecture::PyramidFlux => (
                vec![tower(TowerKind::ClipL, "text_encoder", "tokenizer")],
                tower(TowerKind::T5Xxl, "text_encoder_2", "tokenizer_2"),
            ),
        };
        Self {
            transformer: root.join(variant.dir_name()),
            vae: root.join("causal_video_vae"),
            clip_towers,
            t5,
            architecture,
            variant,
            root,
        }
    }

    /// Expected layout, failing on the first missing weights directory.
    pub fn resolve(root: impl Into<PathBuf>, architecture: Architecture, variant: ResolutionVariant) -> Result<Self, LoaderError> {
        let layout = Self::expected(root, architecture, variant);
        let mut required: Vec<(&'static str, &Path)> = vec![
            ("transformer", layout.transformer.as_path()),
            ("vae", layout.vae.as_path()),
            ("t5 text encoder", layout.t5.weights.as_path()),
        ];
        for tower in &layout.clip_towers {
            required.push(("clip text encoder", tower.weights.as_path()));
        }
        for (component, dir) in required {
            if !dir.is_dir() {
                return Err(LoaderError::MissingComponent {
                    root: layout.root.display().to_string(),
                    component,
                    expected: dir.display().to_string(),
                });
            }
        }
        Ok(layout)
    }
}
