//! Paired satellite/map data pipeline and PatchGAN discriminator for image-to-image GAN training.
//!
//! - [`transforms`]: paired geometric/normalization pipeline and satellite-only colour jitter
//! - [`corpus`]: raw paired corpus and the providers that fetch it
//! - [`dataset`]: per-split paired samples
//! - [`splits`]: split specification and range resolution
//! - [`loader`]: batched, prefetching, multi-worker iteration
//! - [`datamodule`]: fetch, split and serve loaders
//! - [`discriminator`]: PatchGAN discriminator builder

pub mod config;
pub mod corpus;
pub mod datamodule;
pub mod dataset;
pub mod discriminator;
pub mod error;
pub mod loader;
pub mod splits;
pub mod transforms;

pub use config::{DataConfig, DiscriminatorConfig, TransformConfig};
pub use corpus::{
    AutoProvider, CorpusProvider, CorpusSource, DiskCorpus, HubProvider, InMemoryCorpus,
    InMemoryProvider, LocalProvider, RawCorpus, RawPair, SharedCorpus,
};
pub use datamodule::{MagMapDataModule, Split};
pub use dataset::PairedDataset;
pub use discriminator::{ConvBlock, Discriminator, DiscriminatorSpec, LayerSpec};
pub use error::{ArchitectureError, ConfigError, CorpusError, DataError, DataResult, TransformError};
pub use loader::{BatchIter, DataLoader, LoaderConfig, PairBatch};
pub use splits::{SplitRanges, SplitSpec, SplitUnit};
pub use transforms::{build_transform, ColorPipeline, PairParams, PairTransform};
