//! Typed configuration for the data module and the discriminator.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::corpus::CorpusSource;
use crate::error::{ConfigError, TransformError};
use crate::splits::SplitSpec;
use crate::transforms::{build_transform, PairTransform};

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Parameters of one split's paired pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransformConfig {
    pub size: i64,
    pub degrees: f64,
    pub translate: Option<(f64, f64)>,
    pub flip_p: f64,
    pub scale: Option<(f64, f64)>,
    /// One value `s` means `(-s, s)`; two values bound the x shear; four also bound the y shear.
    pub shear: Option<Vec<f64>>,
    pub channel_shuffle: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            size: 256,
            degrees: 0.0,
            translate: None,
            flip_p: 0.0,
            scale: None,
            shear: None,
            channel_shuffle: false,
        }
    }
}

impl TransformConfig {
    pub fn build(&self) -> Result<PairTransform, TransformError> {
        build_transform(
            self.size,
            self.degrees,
            self.translate,
            self.flip_p,
            self.scale,
            self.shear.as_deref(),
            self.channel_shuffle,
        )
    }
}

fn default_data_files() -> Vec<String> {
    vec!["pairs.jsonl".to_string()]
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_num_workers() -> usize {
    4
}

fn default_prefetch_factor() -> usize {
    2
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    /// Hub dataset id, or a local directory holding the manifests.
    pub data_link: String,
    #[serde(default = "default_data_files")]
    pub data_files: Vec<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub split_for_upload: SplitSpec,
    pub batch_size: usize,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Batches each worker may have ready ahead of the consumer.
    #[serde(default = "default_prefetch_factor")]
    pub prefetch_factor: usize,
    /// Base seed for shuffling and augmentation. Random when unset.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_true")]
    pub pin_memory: bool,
    #[serde(default)]
    pub train_transforms: TransformConfig,
    #[serde(default)]
    pub valid_transforms: TransformConfig,
    #[serde(default)]
    pub test_transforms: TransformConfig,
}

impl DataConfig {
    pub fn new(data_link: impl Into<String>, batch_size: usize) -> Self {
        Self {
            data_link: data_link.into(),
            data_files: default_data_files(),
            data_dir: default_data_dir(),
            split_for_upload: SplitSpec::default(),
            batch_size,
            num_workers: default_num_workers(),
            prefetch_factor: default_prefetch_factor(),
            seed: None,
            pin_memory: true,
            train_transforms: TransformConfig::default(),
            valid_transforms: TransformConfig::default(),
            test_transforms: TransformConfig::default(),
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let cfg: Self = load_json(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_link.trim().is_empty() {
            return Err(ConfigError::InvalidField {
                field: "data_link",
                msg: "must not be empty".to_string(),
            });
        }
        if self.data_files.is_empty() {
            return Err(ConfigError::InvalidField {
                field: "data_files",
                msg: "at least one manifest is required".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidField {
                field: "batch_size",
                msg: "must be at least 1".to_string(),
            });
        }
        if self.num_workers > 0 && self.prefetch_factor == 0 {
            return Err(ConfigError::InvalidField {
                field: "prefetch_factor",
                msg: "must be at least 1 when workers are used".to_string(),
            });
        }
        for block in [
            &self.train_transforms,
            &self.valid_transforms,
            &self.test_transforms,
        ] {
            block.build()?;
        }
        Ok(())
    }

    pub fn source(&self) -> CorpusSource {
        CorpusSource {
            data_link: self.data_link.clone(),
            data_files: self.data_files.clone(),
            data_dir: self.data_dir.clone(),
        }
    }
}

/// Structured form of the discriminator hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscriminatorConfig {
    pub channels: i64,
    pub num_features: i64,
    pub depth: i64,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            channels: 3,
            num_features: 64,
            depth: 4,
        }
    }
}

impl DiscriminatorConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        load_json(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splits::SplitUnit;

    #[test]
    fn data_config_defaults() {
        let cfg: DataConfig =
            serde_json::from_str(r#"{"data_link": "user/magmap", "batch_size": 8}"#).unwrap();
        assert_eq!(cfg, DataConfig::new("user/magmap", 8));
        assert_eq!(cfg.split_for_upload.unit, SplitUnit::Percent);
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.num_workers, 4);
        assert_eq!(cfg.prefetch_factor, 2);
        assert_eq!(cfg.train_transforms.size, 256);
        cfg.validate().unwrap();
    }

    #[test]
    fn full_data_config_parses() {
        let raw = r#"{
            "data_link": "/srv/magmap",
            "data_files": ["a.jsonl", "b.jsonl"],
            "split_for_upload": [70, 20, 10, "count"],
            "batch_size": 4,
            "num_workers": 0,
            "prefetch_factor": 0,
            "train_transforms": {"size": 128, "degrees": 15, "translate": [0.1, 0.1],
                                 "flip_p": 0.5, "scale": [0.9, 1.1], "shear": [5],
                                 "channel_shuffle": true},
            "valid_transforms": {"size": 128},
            "test_transforms": {"size": 128}
        }"#;
        let cfg: DataConfig = serde_json::from_str(raw).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.split_for_upload, SplitSpec::count(70, 20, 10));
        assert_eq!(cfg.train_transforms.shear, Some(vec![5.0]));
        assert_eq!(cfg.train_transforms.build().unwrap().ops().len(), 6);
    }

    #[test]
    fn invalid_fields_are_rejected() {
        let mut cfg = DataConfig::new("x", 0);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidField {
                field: "batch_size",
                ..
            })
        ));
        cfg.batch_size = 2;
        cfg.train_transforms.scale = Some((2.0, 1.0));
        assert!(matches!(cfg.validate(), Err(ConfigError::Transform(_))));
        assert!(serde_json::from_str::<DataConfig>(
            r#"{"data_link": "x", "batch_size": 1, "batchsize": 2}"#
        )
        .is_err());
    }

    #[test]
    fn discriminator_config_defaults() {
        let cfg: DiscriminatorConfig = serde_json::from_str(r#"{"depth": 3}"#).unwrap();
        assert_eq!(
            cfg,
            DiscriminatorConfig {
                channels: 3,
                num_features: 64,
                depth: 3
            }
        );
    }
}
