use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rayon::prelude::*;

use crate::augmentors::Augmentor;
use crate::dataset::{Sample, write_manifest_csv};
use crate::transformers::{ImageResizer, LabelIndexer, LabelPadding};

/// Stages applied to every sample after it is read and augmented.
#[derive(Debug, Clone)]
pub struct Transformers {
    pub resizer: ImageResizer,
    pub indexer: LabelIndexer,
    pub padding: LabelPadding,
}

/// A ready-to-train batch.
#[derive(Debug)]
pub struct Batch {
    /// `(batch, 3, height, width)` f32 in `[0, 1]`
    pub images: Tensor,
    /// `(batch, max_text_length)` u32, padded with the blank index
    pub labels: Tensor,
    pub texts: Vec<String>,
}

/// Lazily loads, augments and encodes manifest entries batch by batch.
#[derive(Debug, Clone)]
pub struct DataProvider {
    dataset: Vec<Sample>,
    batch_size: usize,
    transformers: Transformers,
    augmentors: Vec<Arc<dyn Augmentor>>,
    shuffle: bool,
}

impl DataProvider {
    pub fn new(
        dataset: Vec<Sample>,
        batch_size: usize,
        skip_validation: bool,
        transformers: Transformers,
    ) -> Self {
        let mut provider = Self {
            dataset,
            batch_size: batch_size.max(1),
            transformers,
            augmentors: Vec::new(),
            shuffle: true,
        };
        if !skip_validation {
            provider.validate();
        }
        provider
    }

    /// Drops samples whose image file is gone.
    pub fn validate(&mut self) {
        let before = self.dataset.len();
        self.dataset.retain(|sample| {
            let exists = sample.path.exists();
            if !exists {
                tracing::warn!("File not found: {:?}", sample.path);
            }
            exists
        });
        tracing::info!("validated {} of {} samples", self.dataset.len(), before);
    }

    pub fn dataset(&self) -> &[Sample] {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn set_augmentors(&mut self, augmentors: Vec<Arc<dyn Augmentor>>) {
        self.augmentors = augmentors;
    }

    pub fn set_shuffle(&mut self, shuffle: bool) {
        self.shuffle = shuffle;
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Number of batches per epoch; the last one may be short.
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Order-preserving split; the first `floor(len * split)` samples go to training.
    /// Neither half inherits augmentors and the second half is not shuffled.
    pub fn split(&self, split: f64) -> (DataProvider, DataProvider) {
        let index = ((self.dataset.len() as f64) * split.clamp(0.0, 1.0)).floor() as usize;
        let (train, val) = self.dataset.split_at(index);

        let mut train_provider = self.with_dataset(train.to_vec());
        let mut val_provider = self.with_dataset(val.to_vec());
        train_provider.shuffle = self.shuffle;
        val_provider.shuffle = false;

        tracing::info!(
            "split dataset into {} training and {} validation samples",
            train_provider.dataset.len(),
            val_provider.dataset.len()
        );
        (train_provider, val_provider)
    }

    fn with_dataset(&self, dataset: Vec<Sample>) -> DataProvider {
        DataProvider {
            dataset,
            batch_size: self.batch_size,
            transformers: self.transformers.clone(),
            augmentors: Vec::new(),
            shuffle: self.shuffle,
        }
    }

    /// Sample order for one epoch, chunked into batches.
    pub fn epoch_batches(&self) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut rand::thread_rng());
        }
        order
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }

    /// Reads, augments, resizes and encodes one sample.
    pub fn process(&self, sample: &Sample) -> Result<(Vec<f32>, Vec<u32>)> {
        let mut image = image::open(&sample.path)
            .with_context(|| format!("Failed to open image {:?}", sample.path))?
            .to_rgb8();

        let mut rng = rand::thread_rng();
        for augmentor in &self.augmentors {
            image = augmentor.augment(image, &mut rng);
        }

        let image = self.transformers.resizer.resize(&image);
        let (width, height) = image.dimensions();
        let plane = (width * height) as usize;
        let mut pixels = vec![0f32; 3 * plane];
        for (x, y, pixel) in image.enumerate_pixels() {
            let offset = (y * width + x) as usize;
            for c in 0..3 {
                pixels[c * plane + offset] = pixel[c] as f32 / 255.0;
            }
        }

        let label = self.transformers.indexer.index(&sample.label);
        let label = self.transformers.padding.pad(label);

        Ok((pixels, label))
    }

    /// Loads the given sample indices on `pool` and stacks them into tensors.
    pub fn load_batch(
        &self,
        indices: &[usize],
        device: &Device,
        pool: &rayon::ThreadPool,
    ) -> Result<Batch> {
        let samples: Vec<&Sample> = indices.iter().map(|&i| &self.dataset[i]).collect();
        let processed = pool.install(|| {
            samples
                .par_iter()
                .map(|sample| self.process(sample))
                .collect::<Result<Vec<_>>>()
        })?;

        let resizer = &self.transformers.resizer;
        let label_len = self.transformers.padding.max_word_length;
        let batch = processed.len();

        let mut pixels = Vec::with_capacity(batch * 3 * (resizer.width * resizer.height) as usize);
        let mut labels = Vec::with_capacity(batch * label_len);
        for (image, label) in processed {
            pixels.extend(image);
            labels.extend(label);
        }

        Ok(Batch {
            images: Tensor::from_vec(
                pixels,
                (batch, 3, resizer.height as usize, resizer.width as usize),
                device,
            )?,
            labels: Tensor::from_vec(labels, (batch, label_len), device)?,
            texts: samples.iter().map(|s| s.label.clone()).collect(),
        })
    }

    pub fn to_csv(&self, path: &Path) -> Result<()> {
        write_manifest_csv(path, &self.dataset)?;
        tracing::info!("wrote {} samples to {:?}", self.dataset.len(), path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augmentors::RandomBrightness;
    use image::{Rgb, RgbImage};

    fn transformers(vocab: &str, max_len: usize) -> Transformers {
        Transformers {
            resizer: ImageResizer::new(16, 8, true),
            indexer: LabelIndexer::new(vocab),
            padding: LabelPadding::new(max_len, vocab.chars().count() as u32),
        }
    }

    fn samples(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| Sample::new(format!("/nonexistent/{i}.JPG"), format!("s{i}")))
            .collect()
    }

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    #[test]
    fn test_split_ten_gives_nine_and_one() {
        let provider = DataProvider::new(samples(10), 4, true, transformers("s0123456789", 2));
        let (train, val) = provider.split(0.9);

        assert_eq!(train.dataset().len(), 9);
        assert_eq!(val.dataset().len(), 1);
        assert_eq!(train.dataset(), &provider.dataset()[..9]);
        assert_eq!(val.dataset()[0].label, "s9");
    }

    #[test]
    fn test_split_floors_small_datasets() {
        let provider = DataProvider::new(samples(1), 4, true, transformers("s0", 2));
        let (train, val) = provider.split(0.9);
        assert!(train.is_empty());
        assert_eq!(val.dataset().len(), 1);

        let provider = DataProvider::new(samples(25), 4, true, transformers("s0", 2));
        let (train, val) = provider.split(0.9);
        assert_eq!((train.dataset().len(), val.dataset().len()), (22, 3));
    }

    #[test]
    fn test_split_drops_augmentors() {
        let mut provider = DataProvider::new(samples(4), 2, true, transformers("s0", 2));
        provider.set_augmentors(vec![Arc::new(RandomBrightness::default())]);
        let (train, val) = provider.split(0.5);
        assert!(train.augmentors.is_empty());
        assert!(val.augmentors.is_empty());
        assert!(!val.shuffle);
    }

    #[test]
    fn test_validation_removes_missing_files() {
        let provider = DataProvider::new(samples(3), 2, false, transformers("s0", 2));
        assert!(provider.is_empty());
        assert_eq!(provider.len(), 0);
    }

    #[test]
    fn test_epoch_batches_cover_every_sample() {
        let provider = DataProvider::new(samples(7), 3, true, transformers("s0", 2));
        assert_eq!(provider.len(), 3);

        let batches = provider.epoch_batches();
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 3, 1]);
        let mut seen: Vec<usize> = batches.concat();
        seen.sort();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_load_batch_encodes_images_and_labels() {
        let dir = tempfile::tempdir().unwrap();
        let mut dataset = Vec::new();
        for (name, label) in [("a", "ab"), ("b", "b")] {
            let path = dir.path().join(format!("{name}.png"));
            RgbImage::from_pixel(32, 16, Rgb([255, 255, 255])).save(&path).unwrap();
            dataset.push(Sample::new(path, label));
        }

        let provider = DataProvider::new(dataset, 2, false, transformers("ab", 3));
        let batch = provider.load_batch(&[0, 1], &Device::Cpu, &pool()).unwrap();

        assert_eq!(batch.images.dims(), &[2, 3, 8, 16]);
        assert_eq!(
            batch.labels.to_vec2::<u32>().unwrap(),
            vec![vec![0, 1, 2], vec![1, 2, 2]]
        );
        assert_eq!(batch.texts, vec!["ab", "b"]);
        let max = batch.images.max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((max - 1.0).abs() < 1e-6);
    }

    #[derive(Debug)]
    struct Invert;

    impl Augmentor for Invert {
        fn augment(&self, mut image: RgbImage, _rng: &mut dyn rand::RngCore) -> RgbImage {
            image::imageops::invert(&mut image);
            image
        }
    }

    #[test]
    fn test_augmentors_apply_to_training_batches_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut dataset = Vec::new();
        for i in 0..4 {
            let path = dir.path().join(format!("{i}.png"));
            RgbImage::from_pixel(16, 8, Rgb([255, 255, 255])).save(&path).unwrap();
            dataset.push(Sample::new(path, "ab"));
        }

        let provider = DataProvider::new(dataset, 2, false, transformers("ab", 2));
        let (mut train, val) = provider.split(0.5);
        train.set_augmentors(vec![Arc::new(Invert)]);

        let pool = pool();
        let max_of = |provider: &DataProvider| {
            let batch = provider.load_batch(&[0, 1], &Device::Cpu, &pool).unwrap();
            batch.images.max_all().unwrap().to_scalar::<f32>().unwrap()
        };

        assert_eq!(max_of(&train), 0.0);
        assert!((max_of(&val) - 1.0).abs() < 1e-6);

        let (pixels, _) = val.process(&val.dataset()[0]).unwrap();
        assert!(pixels.iter().all(|&p| (p - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_to_csv_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DataProvider::new(samples(2), 2, true, transformers("s0", 2));
        let path = dir.path().join("train.csv");

        provider.to_csv(&path).unwrap();
        let written = crate::dataset::read_manifest_csv(&path).unwrap();
        assert_eq!(written, provider.dataset());
    }
}
