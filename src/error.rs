//! Error types shared by the data pipeline and the discriminator builder.

use std::path::PathBuf;
use thiserror::Error;

pub type DataResult<T> = Result<T, DataError>;

/// Invalid or unreadable configuration. Always fatal at setup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid split {train}/{val}/{test} ({unit}) for {total} records: {msg}")]
    InvalidSplit {
        train: u64,
        val: u64,
        test: u64,
        unit: String,
        total: usize,
        msg: String,
    },
    #[error("invalid value for `{field}`: {msg}")]
    InvalidField { field: &'static str, msg: String },
    #[error("io error reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse error in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// Malformed transform parameters, rejected when the pipeline is built.
#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
    #[error("size must be at least 1, got {0}")]
    Size(i64),
    #[error("`{field}` is out of range: {msg}")]
    OutOfRange { field: &'static str, msg: String },
    #[error("`{field}` range is inverted: ({lo}, {hi})")]
    InvertedRange {
        field: &'static str,
        lo: f64,
        hi: f64,
    },
}

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("manifest {path} line {line}: {source}")]
    Manifest {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("hub fetch of `{file}` from {repo} failed: {source}")]
    Hub {
        repo: String,
        file: String,
        #[source]
        source: hf_hub::api::sync::ApiError,
    },
    #[error("record {index} out of range for corpus of {len}")]
    OutOfRange { index: usize, len: usize },
    #[error("{0}")]
    Other(String),
}

/// Failures while producing samples and batches.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("error processing sample {index}: {source}")]
    Sample {
        index: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("batch {batch} could not be collated: {msg}")]
    Collate { batch: usize, msg: String },
    #[error("data module is not set up; call setup() first")]
    NotReady,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
}

impl DataError {
    pub fn sample<E>(index: usize, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        DataError::Sample {
            index,
            source: source.into(),
        }
    }
}

/// Discriminator hyperparameters that cannot produce a network.
#[derive(Debug, Error, PartialEq)]
pub enum ArchitectureError {
    #[error("depth must be at least 1, got {0}")]
    Depth(i64),
    #[error("num_features must be positive, got {0}")]
    Features(i64),
    #[error("channels must be positive, got {0}")]
    Channels(i64),
    #[error("input of side {input} is too small for depth {depth}")]
    InputTooSmall { input: i64, depth: i64 },
}
