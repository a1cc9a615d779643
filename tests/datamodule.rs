//! End-to-end checks of the data module against in-memory and on-disk corpora.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use image::{DynamicImage, Rgb, RgbImage};
use magmap_gan::corpus::ManifestEntry;
use magmap_gan::{
    AutoProvider, DataConfig, DataError, InMemoryCorpus, InMemoryProvider, MagMapDataModule,
    RawPair, Split, SplitSpec, TransformConfig,
};

fn pair(i: usize) -> RawPair {
    let sat = RgbImage::from_fn(16, 16, |x, y| Rgb([(x * 8) as u8, (y * 8) as u8, i as u8]));
    let map = RgbImage::from_fn(16, 16, |x, y| Rgb([i as u8, (x * 4) as u8, (y * 4) as u8]));
    RawPair {
        sat_image: DynamicImage::ImageRgb8(sat),
        map_image: DynamicImage::ImageRgb8(map),
    }
}

fn provider(n: usize) -> Arc<InMemoryProvider> {
    Arc::new(InMemoryProvider::new(Arc::new(InMemoryCorpus::new(
        (0..n).map(pair).collect(),
    ))))
}

fn config(split: SplitSpec) -> DataConfig {
    let small = TransformConfig {
        size: 8,
        ..TransformConfig::default()
    };
    DataConfig {
        split_for_upload: split,
        num_workers: 2,
        seed: Some(1234),
        train_transforms: TransformConfig {
            degrees: 20.0,
            flip_p: 0.5,
            channel_shuffle: true,
            ..small.clone()
        },
        valid_transforms: small.clone(),
        test_transforms: small,
        ..DataConfig::new("memory", 4)
    }
}

#[test]
fn percent_split_example() -> anyhow::Result<()> {
    let mut dm = MagMapDataModule::new(config(SplitSpec::percent(80, 10, 10)), provider(100))?;
    dm.setup()?;
    let r = dm.ranges()?;
    assert_eq!((r.train.clone(), r.val.clone(), r.test.clone()), (0..80, 80..90, 90..100));
    assert_eq!(dm.dataset(Split::Train)?.len(), 80);
    assert_eq!(dm.dataset(Split::Val)?.len(), 10);
    assert_eq!(dm.dataset(Split::Test)?.len(), 10);
    Ok(())
}

#[test]
fn count_split_example() -> anyhow::Result<()> {
    let mut dm = MagMapDataModule::new(config(SplitSpec::count(70, 20, 10)), provider(100))?;
    dm.setup()?;
    let r = dm.ranges()?;
    assert_eq!((r.train.clone(), r.val.clone(), r.test.clone()), (0..70, 70..90, 90..100));
    Ok(())
}

// Shares summing below 100% are intended: the test split takes the remainder.
#[test]
fn short_percent_split_grows_the_test_split() -> anyhow::Result<()> {
    let mut dm = MagMapDataModule::new(config(SplitSpec::percent(60, 10, 10)), provider(100))?;
    dm.setup()?;
    assert_eq!(dm.ranges()?.lens(), (60, 10, 30));
    Ok(())
}

#[test]
fn oversized_split_fails_setup() -> anyhow::Result<()> {
    let mut dm = MagMapDataModule::new(config(SplitSpec::count(90, 20, 0)), provider(100))?;
    let err = dm.setup().unwrap_err();
    assert!(matches!(err, DataError::Config(_)), "{err}");
    assert!(!dm.is_ready());
    Ok(())
}

#[test]
fn loaders_need_setup() -> anyhow::Result<()> {
    let dm = MagMapDataModule::new(config(SplitSpec::default()), provider(10))?;
    assert!(matches!(dm.train_dataloader(), Err(DataError::NotReady)));
    assert!(matches!(dm.ranges(), Err(DataError::NotReady)));
    Ok(())
}

#[test]
fn invalid_transform_config_fails_construction() {
    let mut cfg = config(SplitSpec::default());
    cfg.valid_transforms.size = 0;
    assert!(MagMapDataModule::new(cfg, provider(10)).is_err());
}

#[test]
fn setup_is_repeatable() -> anyhow::Result<()> {
    let provider = provider(50);
    let mut dm = MagMapDataModule::new(config(SplitSpec::default()), provider.clone())?;
    dm.setup()?;
    let first = dm.ranges()?.clone();
    dm.setup()?;
    assert_eq!(dm.ranges()?, &first);
    assert_eq!(provider.fetches(), 2);
    Ok(())
}

#[test]
fn only_train_gets_colour_jitter_and_shuffling() -> anyhow::Result<()> {
    let mut dm = MagMapDataModule::new(config(SplitSpec::default()), provider(40))?;
    dm.setup()?;
    assert!(dm.dataset(Split::Train)?.color().is_some());
    assert!(dm.dataset(Split::Val)?.color().is_none());
    assert!(dm.dataset(Split::Test)?.color().is_none());

    assert!(dm.train_dataloader()?.config().shuffle);
    assert!(!dm.val_dataloader()?.config().shuffle);
    assert!(!dm.test_dataloader()?.config().shuffle);

    let val: Vec<usize> = dm
        .val_dataloader()?
        .iter()
        .flat_map(|b| b.map(|b| b.indices).unwrap_or_default())
        .collect();
    assert_eq!(val, (0..4).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn batches_have_the_configured_shape() -> anyhow::Result<()> {
    let mut dm = MagMapDataModule::new(config(SplitSpec::default()), provider(20))?;
    dm.setup()?;
    let loader = dm.train_dataloader()?;
    let batches: Vec<_> = loader.iter().collect::<Result<_, _>>()?;
    assert_eq!(batches.len(), 4);
    for batch in &batches {
        assert_eq!(batch.source.size(), [4, 3, 8, 8]);
        assert_eq!(batch.target.size(), [4, 3, 8, 8]);
        assert!(batch.failures.is_empty());
        assert!(batch.source.abs().max().double_value(&[]) <= 1.0);
    }
    let mut seen: Vec<usize> = batches.into_iter().flat_map(|b| b.indices).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..16).collect::<Vec<_>>());
    Ok(())
}

fn write_corpus(root: &Path, n: usize) -> anyhow::Result<()> {
    fs::create_dir_all(root.join("images"))?;
    let mut manifest = fs::File::create(root.join("pairs.jsonl"))?;
    for i in 0..n {
        let entry = ManifestEntry {
            sat_image: format!("images/{i}_sat.png"),
            map_image: format!("images/{i}_map.png"),
        };
        let RawPair {
            sat_image,
            map_image,
        } = pair(i);
        sat_image.save(root.join(&entry.sat_image))?;
        map_image.save(root.join(&entry.map_image))?;
        writeln!(manifest, "{}", serde_json::to_string(&entry)?)?;
    }
    Ok(())
}

#[test]
fn local_directory_round_trip() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    write_corpus(tmp.path(), 10)?;
    // A broken record in the validation range.
    fs::write(tmp.path().join("images/8_map.png"), b"not a png")?;

    let raw = format!(
        r#"{{
            "data_link": "{}",
            "data_dir": "{}",
            "split_for_upload": [6, 3, 1, "count"],
            "batch_size": 2,
            "num_workers": 1,
            "seed": 9,
            "train_transforms": {{"size": 8, "flip_p": 0.5}},
            "valid_transforms": {{"size": 8}},
            "test_transforms": {{"size": 8}}
        }}"#,
        tmp.path().display(),
        tmp.path().join("cache").display()
    );
    let cfg_path = tmp.path().join("data.json");
    fs::write(&cfg_path, raw)?;
    let cfg = DataConfig::from_json_file(&cfg_path)?;

    let mut dm = MagMapDataModule::new(cfg, Arc::new(AutoProvider::default()))?;
    dm.setup()?;
    assert_eq!(dm.ranges()?.lens(), (6, 3, 1));

    let train: Vec<_> = dm.train_dataloader()?.iter().collect::<Result<_, _>>()?;
    assert_eq!(train.iter().map(|b| b.len()).sum::<usize>(), 6);

    let val: Vec<_> = dm.val_dataloader()?.iter().collect();
    assert_eq!(val.len(), 2);
    let first = val[0].as_ref().map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(first.indices, vec![0, 1]);
    assert!(first.failures.is_empty());
    // Corpus record 8 is index 2 of the validation split and alone in its batch, so the batch
    // has nothing to collate.
    match &val[1] {
        Err(DataError::Collate { batch: 1, msg }) => assert!(msg.contains("sample 2"), "{msg}"),
        other => panic!("expected a collate failure, got {other:?}"),
    }

    let test: Vec<_> = dm.test_dataloader()?.iter().collect::<Result<_, _>>()?;
    assert_eq!(test[0].indices, vec![0]);
    Ok(())
}
