//! Split orchestration: fetch the corpus once, cut it into train/val/test ranges and serve a
//! loader per split.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::config::DataConfig;
use crate::corpus::{CorpusProvider, SharedCorpus};
use crate::dataset::PairedDataset;
use crate::error::{ConfigError, DataError, DataResult};
use crate::loader::{DataLoader, LoaderConfig};
use crate::splits::SplitRanges;
use crate::transforms::{ColorPipeline, PairTransform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Val => write!(f, "val"),
            Split::Test => write!(f, "test"),
        }
    }
}

#[derive(Debug)]
struct Ready {
    corpus: SharedCorpus,
    ranges: SplitRanges,
    train: DataLoader,
    val: DataLoader,
    test: DataLoader,
}

/// Satellite/map data module. Unconfigured until [`MagMapDataModule::setup`] succeeds.
pub struct MagMapDataModule {
    cfg: DataConfig,
    provider: Arc<dyn CorpusProvider>,
    train_transform: PairTransform,
    valid_transform: PairTransform,
    test_transform: PairTransform,
    seed: u64,
    state: Option<Ready>,
}

impl fmt::Debug for MagMapDataModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MagMapDataModule")
            .field("cfg", &self.cfg)
            .field("seed", &self.seed)
            .field("ready", &self.state.is_some())
            .finish()
    }
}

impl MagMapDataModule {
    /// Validates the configuration and builds the three pipelines.
    pub fn new(cfg: DataConfig, provider: Arc<dyn CorpusProvider>) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let train_transform = cfg.train_transforms.build()?;
        let valid_transform = cfg.valid_transforms.build()?;
        let test_transform = cfg.test_transforms.build()?;
        let seed = cfg.seed.unwrap_or_else(rand::random);
        Ok(Self {
            cfg,
            provider,
            train_transform,
            valid_transform,
            test_transform,
            seed,
            state: None,
        })
    }

    pub fn config(&self) -> &DataConfig {
        &self.cfg
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_some()
    }

    pub fn transform(&self, split: Split) -> &PairTransform {
        match split {
            Split::Train => &self.train_transform,
            Split::Val => &self.valid_transform,
            Split::Test => &self.test_transform,
        }
    }

    /// Fetch the corpus, resolve the split and build one dataset and loader per split. Calling
    /// it again rebuilds everything from a fresh fetch.
    pub fn setup(&mut self) -> DataResult<()> {
        self.state = None;
        let corpus = self.provider.fetch(&self.cfg.source())?;
        let total = corpus.len();
        let ranges = self.cfg.split_for_upload.resolve(total)?;
        let (train_len, val_len, test_len) = ranges.lens();
        info!(
            total,
            train = train_len,
            val = val_len,
            test = test_len,
            "resolved splits"
        );

        let train = PairedDataset::new(
            corpus.clone(),
            ranges.train.clone(),
            Some(self.train_transform.clone()),
            Some(ColorPipeline::satellite()),
        );
        let val = PairedDataset::new(
            corpus.clone(),
            ranges.val.clone(),
            Some(self.valid_transform.clone()),
            None,
        );
        let test = PairedDataset::new(
            corpus.clone(),
            ranges.test.clone(),
            Some(self.test_transform.clone()),
            None,
        );

        self.state = Some(Ready {
            corpus,
            ranges,
            train: DataLoader::new(Arc::new(train), self.loader_config(Split::Train)),
            val: DataLoader::new(Arc::new(val), self.loader_config(Split::Val)),
            test: DataLoader::new(Arc::new(test), self.loader_config(Split::Test)),
        });
        Ok(())
    }

    fn loader_config(&self, split: Split) -> LoaderConfig {
        LoaderConfig {
            batch_size: self.cfg.batch_size,
            num_workers: self.cfg.num_workers,
            prefetch_factor: self.cfg.prefetch_factor,
            shuffle: split == Split::Train,
            pin_memory: self.cfg.pin_memory,
            seed: self.seed,
        }
    }

    fn ready(&self) -> DataResult<&Ready> {
        self.state.as_ref().ok_or(DataError::NotReady)
    }

    pub fn corpus(&self) -> DataResult<&SharedCorpus> {
        Ok(&self.ready()?.corpus)
    }

    pub fn ranges(&self) -> DataResult<&SplitRanges> {
        Ok(&self.ready()?.ranges)
    }

    pub fn loader(&self, split: Split) -> DataResult<&DataLoader> {
        let ready = self.ready()?;
        Ok(match split {
            Split::Train => &ready.train,
            Split::Val => &ready.val,
            Split::Test => &ready.test,
        })
    }

    pub fn dataset(&self, split: Split) -> DataResult<&PairedDataset> {
        Ok(self.loader(split)?.dataset())
    }

    pub fn train_dataloader(&self) -> DataResult<&DataLoader> {
        self.loader(Split::Train)
    }

    pub fn val_dataloader(&self) -> DataResult<&DataLoader> {
        self.loader(Split::Val)
    }

    pub fn test_dataloader(&self) -> DataResult<&DataLoader> {
        self.loader(Split::Test)
    }
}
