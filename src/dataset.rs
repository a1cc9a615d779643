//! Paired satellite/map samples over a range of the raw corpus.

use std::error::Error;
use std::ops::Range;

use rand::Rng;
use tch::Tensor;

use crate::corpus::SharedCorpus;
use crate::error::{CorpusError, DataError, DataResult};
use crate::transforms::{ColorPipeline, PairTransform};

#[derive(Debug, Clone)]
pub struct PairedDataset {
    corpus: SharedCorpus,
    range: Range<usize>,
    transform: PairTransform,
    color: Option<ColorPipeline>,
}

impl PairedDataset {
    /// `range` selects the corpus records this dataset exposes; index 0 is `range.start`.
    /// Without a transform, samples are only converted and normalized.
    pub fn new(
        corpus: SharedCorpus,
        range: Range<usize>,
        transform: Option<PairTransform>,
        color: Option<ColorPipeline>,
    ) -> Self {
        Self {
            corpus,
            range,
            transform: transform.unwrap_or_else(PairTransform::minimal),
            color,
        }
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    pub fn transform(&self) -> &PairTransform {
        &self.transform
    }

    pub fn color(&self) -> Option<&ColorPipeline> {
        self.color.as_ref()
    }

    /// Produce the (satellite, map) tensors for `index`. Every failure is reported as a sample
    /// error carrying the index.
    pub fn get<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> DataResult<(Tensor, Tensor)> {
        self.load(index, rng).map_err(|e| DataError::sample(index, e))
    }

    fn load<R: Rng + ?Sized>(
        &self,
        index: usize,
        rng: &mut R,
    ) -> Result<(Tensor, Tensor), Box<dyn Error + Send + Sync>> {
        if index >= self.len() {
            return Err(CorpusError::OutOfRange {
                index,
                len: self.len(),
            }
            .into());
        }
        let raw = self.corpus.get(self.range.start + index)?;
        let sat = raw.sat_image.to_rgb8();
        let map = raw.map_image.to_rgb8();
        let sat = match &self.color {
            Some(color) => color.apply(&sat, rng),
            None => sat,
        };
        Ok(self.transform.apply(&sat, &map, rng)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{InMemoryCorpus, RawCorpus, RawPair};
    use crate::transforms::{build_transform, PairParams};
    use image::{DynamicImage, Rgb, RgbImage};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn pair(i: u8) -> RawPair {
        let sat = RgbImage::from_fn(8, 8, |x, y| Rgb([x as u8 * 20 + i, y as u8 * 30, 90]));
        let map = RgbImage::from_fn(8, 8, |x, y| Rgb([200, x as u8 * 10, y as u8 * 10 + i]));
        RawPair {
            sat_image: DynamicImage::ImageRgb8(sat),
            map_image: DynamicImage::ImageRgb8(map),
        }
    }

    fn corpus(n: u8) -> SharedCorpus {
        Arc::new(InMemoryCorpus::new((0..n).map(pair).collect()))
    }

    #[derive(Debug)]
    struct Broken;

    impl RawCorpus for Broken {
        fn len(&self) -> usize {
            4
        }

        fn get(&self, index: usize) -> Result<RawPair, CorpusError> {
            Err(CorpusError::Other(format!("record {index} is corrupt")))
        }
    }

    #[test]
    fn length_follows_the_range() {
        let ds = PairedDataset::new(corpus(10), 3..7, None, None);
        assert_eq!(ds.len(), 4);
        assert!(!ds.is_empty());
        assert!(PairedDataset::new(corpus(10), 5..5, None, None).is_empty());
    }

    #[test]
    fn index_is_relative_to_the_range() {
        let ds = PairedDataset::new(corpus(5), 2..5, None, None);
        let mut rng = StdRng::seed_from_u64(0);
        let (sat, _) = ds.get(0, &mut rng).unwrap();
        let expected = pair(2).sat_image.to_rgb8();
        let (direct, _) = PairTransform::minimal()
            .apply_with(&expected, &expected, &PairParams::default())
            .unwrap();
        assert!(sat.equal(&direct));
    }

    #[test]
    fn color_jitter_leaves_the_map_untouched() {
        let transform = build_transform(8, 0.0, None, 0.0, None, None, false).unwrap();
        let jittered = PairedDataset::new(
            corpus(1),
            0..1,
            Some(transform.clone()),
            Some(ColorPipeline::satellite()),
        );
        let plain = PairedDataset::new(corpus(1), 0..1, Some(transform), None);
        let mut rng = StdRng::seed_from_u64(5);
        let (plain_sat, plain_map) = plain.get(0, &mut rng).unwrap();

        let mut source_changed = false;
        for _ in 0..6 {
            let (sat, map) = jittered.get(0, &mut rng).unwrap();
            assert!(map.equal(&plain_map));
            source_changed |= !sat.equal(&plain_sat);
        }
        assert!(source_changed);
    }

    #[test]
    fn failures_name_the_index() {
        let ds = PairedDataset::new(Arc::new(Broken), 0..4, None, None);
        let mut rng = StdRng::seed_from_u64(0);
        let err = ds.get(1, &mut rng).unwrap_err();
        assert!(matches!(err, DataError::Sample { index: 1, .. }));
        let msg = err.to_string();
        assert!(msg.contains("sample 1"), "{msg}");
        assert!(msg.contains("corrupt"), "{msg}");
    }

    #[test]
    fn out_of_range_is_a_sample_error() {
        let ds = PairedDataset::new(corpus(3), 0..3, None, None);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            ds.get(3, &mut rng),
            Err(DataError::Sample { index: 3, .. })
        ));
    }
}
