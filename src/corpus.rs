//! Raw paired corpus and the providers that fetch it.

use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hf_hub::api::sync::ApiBuilder;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CorpusError;

/// One satellite photo with its map rendering.
#[derive(Debug, Clone)]
pub struct RawPair {
    pub sat_image: DynamicImage,
    pub map_image: DynamicImage,
}

/// Ordered, indexable, read-only collection of pairs.
pub trait RawCorpus: Debug + Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<RawPair, CorpusError>;
}

pub type SharedCorpus = Arc<dyn RawCorpus>;

/// Where a corpus lives: a Hub dataset id or a local directory, the JSONL manifests inside it,
/// and the cache directory for remote files.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusSource {
    pub data_link: String,
    pub data_files: Vec<String>,
    pub data_dir: PathBuf,
}

/// Fetches a corpus. Implementations must be idempotent: a second fetch reuses the cache.
pub trait CorpusProvider: Send + Sync {
    fn fetch(&self, source: &CorpusSource) -> Result<SharedCorpus, CorpusError>;
}

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub sat_image: String,
    pub map_image: String,
}

pub fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>, CorpusError> {
    let raw = fs::read_to_string(path).map_err(|e| CorpusError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| CorpusError::Manifest {
                path: path.to_path_buf(),
                line: i + 1,
                source: e,
            })
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct InMemoryCorpus {
    records: Vec<RawPair>,
}

impl InMemoryCorpus {
    pub fn new(records: Vec<RawPair>) -> Self {
        Self { records }
    }
}

impl RawCorpus for InMemoryCorpus {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, index: usize) -> Result<RawPair, CorpusError> {
        self.records
            .get(index)
            .cloned()
            .ok_or(CorpusError::OutOfRange {
                index,
                len: self.records.len(),
            })
    }
}

/// Pairs of image files decoded on access.
#[derive(Debug, Clone, Default)]
pub struct DiskCorpus {
    pairs: Vec<(PathBuf, PathBuf)>,
}

impl DiskCorpus {
    pub fn new(pairs: Vec<(PathBuf, PathBuf)>) -> Self {
        Self { pairs }
    }

    pub fn pairs(&self) -> &[(PathBuf, PathBuf)] {
        &self.pairs
    }
}

fn open_image(path: &Path) -> Result<DynamicImage, CorpusError> {
    image::open(path).map_err(|e| CorpusError::Image {
        path: path.to_path_buf(),
        source: e,
    })
}

impl RawCorpus for DiskCorpus {
    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn get(&self, index: usize) -> Result<RawPair, CorpusError> {
        let (sat, map) = self.pairs.get(index).ok_or(CorpusError::OutOfRange {
            index,
            len: self.pairs.len(),
        })?;
        Ok(RawPair {
            sat_image: open_image(sat)?,
            map_image: open_image(map)?,
        })
    }
}

/// Reads manifests from a directory on disk. Nothing is copied, so refetching is free.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProvider;

impl CorpusProvider for LocalProvider {
    fn fetch(&self, source: &CorpusSource) -> Result<SharedCorpus, CorpusError> {
        let root = Path::new(&source.data_link);
        let mut pairs = Vec::new();
        for file in &source.data_files {
            let entries = read_manifest(&root.join(file))?;
            debug!(manifest = %file, records = entries.len(), "read manifest");
            pairs.extend(
                entries
                    .into_iter()
                    .map(|e| (root.join(e.sat_image), root.join(e.map_image))),
            );
        }
        let missing = pairs
            .iter()
            .filter(|(s, m)| !s.is_file() || !m.is_file())
            .count();
        if missing > 0 {
            warn!(missing, root = %root.display(), "manifest references missing image files");
        }
        info!(records = pairs.len(), root = %root.display(), "local corpus ready");
        Ok(Arc::new(DiskCorpus::new(pairs)))
    }
}

/// Downloads a dataset repository from the Hugging Face Hub into `data_dir`. The hub cache makes
/// repeated fetches reuse already downloaded files.
#[derive(Debug, Clone, Default)]
pub struct HubProvider {
    token: Option<String>,
}

impl HubProvider {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl CorpusProvider for HubProvider {
    fn fetch(&self, source: &CorpusSource) -> Result<SharedCorpus, CorpusError> {
        let repo_id = source.data_link.clone();
        let hub_err = |file: &str, e| CorpusError::Hub {
            repo: repo_id.clone(),
            file: file.to_string(),
            source: e,
        };
        fs::create_dir_all(&source.data_dir).map_err(|e| CorpusError::Io {
            path: source.data_dir.clone(),
            source: e,
        })?;
        let api = ApiBuilder::new()
            .with_cache_dir(source.data_dir.clone())
            .with_token(self.token.clone())
            .build()
            .map_err(|e| hub_err("<api>", e))?;
        let repo = api.dataset(repo_id.clone());

        let mut pairs = Vec::new();
        for file in &source.data_files {
            let manifest = repo.get(file).map_err(|e| hub_err(file, e))?;
            let entries = read_manifest(&manifest)?;
            info!(repo = %repo_id, manifest = %file, records = entries.len(), "fetching pairs");
            for entry in entries {
                let sat = repo
                    .get(&entry.sat_image)
                    .map_err(|e| hub_err(&entry.sat_image, e))?;
                let map = repo
                    .get(&entry.map_image)
                    .map_err(|e| hub_err(&entry.map_image, e))?;
                pairs.push((sat, map));
            }
        }
        info!(
            repo = %repo_id,
            records = pairs.len(),
            cache = %source.data_dir.display(),
            "hub corpus ready"
        );
        Ok(Arc::new(DiskCorpus::new(pairs)))
    }
}

/// Local directory when `data_link` names one, the Hub otherwise.
#[derive(Debug, Clone, Default)]
pub struct AutoProvider {
    hub: HubProvider,
}

impl AutoProvider {
    pub fn new(hub_token: Option<String>) -> Self {
        Self {
            hub: HubProvider::new(hub_token),
        }
    }
}

impl CorpusProvider for AutoProvider {
    fn fetch(&self, source: &CorpusSource) -> Result<SharedCorpus, CorpusError> {
        if Path::new(&source.data_link).is_dir() {
            LocalProvider.fetch(source)
        } else {
            self.hub.fetch(source)
        }
    }
}

/// Hands out an already built corpus and counts fetches.
#[derive(Debug)]
pub struct InMemoryProvider {
    corpus: SharedCorpus,
    fetches: AtomicUsize,
}

impl InMemoryProvider {
    pub fn new(corpus: SharedCorpus) -> Self {
        Self {
            corpus,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl CorpusProvider for InMemoryProvider {
    fn fetch(&self, _source: &CorpusSource) -> Result<SharedCorpus, CorpusError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.corpus.clone())
    }
}
