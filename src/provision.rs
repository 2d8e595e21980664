//! Weight provisioning: locate a checkpoint on disk or fetch it from the Hub.

use crate::config::{ModelId, ResolutionVariant};
use hf_hub::api::sync::{Api, ApiBuilder, ApiError};
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("hub request for {repo} failed: {source}")]
    Hub {
        repo: String,
        #[source]
        source: ApiError,
    },

    #[error("{repo} lists no files for {variant}")]
    VariantNotListed { repo: String, variant: String },

    #[error("{path} does not contain {variant} and downloads are disabled")]
    NotAvailableLocally { path: String, variant: String },

    #[error("downloaded file {file} is not inside a snapshot of {repo}")]
    UnexpectedCacheLayout { repo: String, file: String },
}

/// Produces a directory holding materialized weights for a model variant.
pub trait Provisioner {
    fn provision(&self, model: ModelId, variant: ResolutionVariant) -> Result<PathBuf, ProvisionError>;
}

/// `<root>/<repo-name>` if it already holds `variant`.
fn local_checkpoint(root: &Path, model: ModelId, variant: ResolutionVariant) -> Option<PathBuf> {
    let dir = root.join(model.dir_name());
    dir.join(variant.dir_name()).is_dir().then_some(dir)
}

/// Repository files needed for `variant`: everything except the other
/// resolution's transformer.
pub fn files_for_variant(listing: &[String], variant: ResolutionVariant) -> Vec<String> {
    let skip = format!("{}/", variant.other().dir_name());
    listing
        .iter()
        .filter(|f| !f.starts_with(&skip))
        .cloned()
        .collect()
}

/// Checkpoints under a local directory only.
pub struct LocalProvisioner {
    pub root: PathBuf,
}

impl Provisioner for LocalProvisioner {
    fn provision(&self, model: ModelId, variant: ResolutionVariant) -> Result<PathBuf, ProvisionError> {
        local_checkpoint(&self.root, model, variant).ok_or_else(|| ProvisionError::NotAvailableLocally {
            path: self.root.join(model.dir_name()).display().to_string(),
            variant: variant.to_string(),
        })
    }
}

/// Local directory first, then a Hugging Face Hub download into the hub cache.
pub struct HubProvisioner {
    pub root: PathBuf,
    pub cache_dir: Option<PathBuf>,
}

impl HubProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache_dir: None,
        }
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    fn api(&self, repo: &str) -> Result<Api, ProvisionError> {
        let builder = match &self.cache_dir {
            Some(dir) => ApiBuilder::new().with_cache_dir(dir.clone()),
            None => ApiBuilder::new(),
        };
        builder.build().map_err(|source| ProvisionError::Hub {
            repo: repo.to_string(),
            source,
        })
    }
}

impl Provisioner for HubProvisioner {
    fn provision(&self, model: ModelId, variant: ResolutionVariant) -> Result<PathBuf, ProvisionError> {
        if let Some(dir) = local_checkpoint(&self.root, model, variant) {
            info!(path = %dir.display(), %variant, "using local checkpoint");
            return Ok(dir);
        }

        let repo_id = model.repo_id();
        let hub_err = |source| ProvisionError::Hub {
            repo: repo_id.to_string(),
            source,
        };
        let repo = self
            .api(repo_id)?
            .repo(Repo::with_revision(repo_id.to_string(), RepoType::Model, "main".into()));
        let listing: Vec<String> = repo
            .info()
            .map_err(hub_err)?
            .siblings
            .into_iter()
            .map(|s| s.rfilename)
            .collect();
        let files = files_for_variant(&listing, variant);
        let variant_prefix = format!("{}/", variant.dir_name());
        if !files.iter().any(|f| f.starts_with(&variant_prefix)) {
            return Err(ProvisionError::VariantNotListed {
                repo: repo_id.to_string(),
                variant: variant.to_string(),
            });
        }

        info!(repo = repo_id, %variant, files = files.len(), "downloading checkpoint");
        let mut snapshot = None;
        for file in &files {
            let path = repo.get(file).map_err(hub_err)?;
            if snapshot.is_none() {
                snapshot = Some(snapshot_root(&path, file).ok_or_else(|| {
                    ProvisionError::UnexpectedCacheLayout {
                        repo: repo_id.to_string(),
                        file: path.display().to_string(),
                    }
                })?);
            }
        }
        snapshot.ok_or_else(|| ProvisionError::VariantNotListed {
            repo: repo_id.to_string(),
            variant: variant.to_string(),
        })
    }
}

/// Strip the repository-relative `rfilename` from a cached file path.
fn snapshot_root(path: &Path, rfilename: &str) -> Option<PathBuf> {
    let depth = Path::new(rfilename).components().count();
    let mut root = path;
    for _ in 0..depth {
        root = root.parent()?;
    }
    Some(root.to_path_buf())
}

/// `tokenizer.json` inside `dir`, else the same file from `fallback_repo` on the Hub.
pub fn tokenizer_file(dir: &Path, fallback_repo: &str) -> Result<PathBuf, ProvisionError> {
    let local = dir.join("tokenizer.json");
    if local.exists() {
        return Ok(local);
    }
    info!(repo = fallback_repo, "fetching tokenizer.json");
    let hub_err = |source| ProvisionError::Hub {
        repo: fallback_repo.to_string(),
        source,
    };
    Api::new()
        .map_err(hub_err)?
        .model(fallback_repo.to_string())
        .get("tokenizer.json")
        .map_err(hub_err)
}
