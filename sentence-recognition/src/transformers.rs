//! Per-sample stages applied after augmentation: resize, label indexing
//! and label padding.

use std::collections::HashMap;

use image::{Rgb, RgbImage, imageops};

#[derive(Debug, Clone)]
pub struct ImageResizer {
    pub width: u32,
    pub height: u32,
    pub keep_aspect_ratio: bool,
    pub padding_color: Rgb<u8>,
}

impl ImageResizer {
    pub fn new(width: u32, height: u32, keep_aspect_ratio: bool) -> Self {
        Self {
            width,
            height,
            keep_aspect_ratio,
            padding_color: Rgb([0, 0, 0]),
        }
    }

    pub fn resize(&self, image: &RgbImage) -> RgbImage {
        if !self.keep_aspect_ratio {
            return imageops::resize(image, self.width, self.height, imageops::FilterType::Triangle);
        }

        let (src_width, src_height) = image.dimensions();
        let ratio = f64::min(
            self.width as f64 / src_width.max(1) as f64,
            self.height as f64 / src_height.max(1) as f64,
        );
        let new_width = ((src_width as f64 * ratio) as u32).clamp(1, self.width);
        let new_height = ((src_height as f64 * ratio) as u32).clamp(1, self.height);
        let resized = imageops::resize(image, new_width, new_height, imageops::FilterType::Triangle);

        let left = (self.width - new_width) / 2;
        let top = (self.height - new_height) / 2;
        let mut canvas = RgbImage::from_pixel(self.width, self.height, self.padding_color);
        imageops::overlay(&mut canvas, &resized, left as i64, top as i64);
        canvas
    }
}

/// Maps characters to their vocabulary index, dropping unknown characters.
#[derive(Debug, Clone)]
pub struct LabelIndexer {
    vocab: Vec<char>,
    lookup: HashMap<char, u32>,
}

impl LabelIndexer {
    pub fn new(vocab: &str) -> Self {
        let vocab: Vec<char> = vocab.chars().collect();
        let lookup = vocab
            .iter()
            .enumerate()
            .map(|(index, &c)| (c, index as u32))
            .collect();
        Self { vocab, lookup }
    }

    pub fn vocab(&self) -> &[char] {
        &self.vocab
    }

    pub fn index(&self, label: &str) -> Vec<u32> {
        label
            .chars()
            .filter_map(|c| self.lookup.get(&c).copied())
            .collect()
    }
}

/// Pads (or truncates) indexed labels to a fixed length.
#[derive(Debug, Clone, Copy)]
pub struct LabelPadding {
    pub max_word_length: usize,
    pub padding_value: u32,
}

impl LabelPadding {
    pub fn new(max_word_length: usize, padding_value: u32) -> Self {
        Self {
            max_word_length,
            padding_value,
        }
    }

    pub fn pad(&self, mut indices: Vec<u32>) -> Vec<u32> {
        indices.truncate(self.max_word_length);
        indices.resize(self.max_word_length, self.padding_value);
        indices
    }
}
