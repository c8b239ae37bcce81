use std::path::Path;
use std::thread;

use anyhow::Context;
use hf_hub::api::sync::Api;
use ndarray::Array4;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::{inputs, value::Tensor};
use serde::Deserialize;
use tokenizers::Tokenizer;

/// ONNX export of `microsoft/trocr-base-printed`.
pub const DEFAULT_REPO: &str = "Xenova/trocr-base-printed";

const DEFAULT_MAX_LENGTH: usize = 64;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ImageSize {
    Square(u32),
    Exact { height: u32, width: u32 },
}

impl ImageSize {
    pub fn dimensions(&self) -> (u32, u32) {
        match *self {
            ImageSize::Square(side) => (side, side),
            ImageSize::Exact { height, width } => (width, height),
        }
    }
}

/// Subset of `preprocessor_config.json` needed to build `pixel_values`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageProcessor {
    #[serde(default = "ImageProcessor::default_size")]
    pub size: ImageSize,
    #[serde(default = "ImageProcessor::default_stat")]
    pub image_mean: [f32; 3],
    #[serde(default = "ImageProcessor::default_stat")]
    pub image_std: [f32; 3],
    #[serde(default = "default_true")]
    pub do_normalize: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ImageProcessor {
    fn default() -> Self {
        Self {
            size: Self::default_size(),
            image_mean: Self::default_stat(),
            image_std: Self::default_stat(),
            do_normalize: true,
        }
    }
}

impl ImageProcessor {
    fn default_size() -> ImageSize {
        ImageSize::Exact {
            height: 384,
            width: 384,
        }
    }

    fn default_stat() -> [f32; 3] {
        [0.5, 0.5, 0.5]
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open preprocessor config at {:?}", path))?;
        serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse preprocessor config at {:?}", path))
    }

    /// RGB conversion, exact resize and mean/std normalization into `(1, 3, H, W)`.
    pub fn preprocess(&self, image: &image::DynamicImage) -> Array4<f32> {
        let (width, height) = self.size.dimensions();
        let image = image.to_rgb8();
        let image = image::imageops::resize(
            &image,
            width,
            height,
            image::imageops::FilterType::Triangle,
        );

        let mut tensor = Array4::zeros((1, 3, height as usize, width as usize));
        for (x, y, pixel) in image.enumerate_pixels() {
            let x = x as usize;
            let y = y as usize;

            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                tensor[[0, c, y, x]] = if self.do_normalize {
                    (value - self.image_mean[c]) / self.image_std[c]
                } else {
                    value
                };
            }
        }

        tensor
    }
}

/// Token ids that drive greedy generation, read from the model `config.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub decoder_start_token_id: i64,
    pub eos_token_id: i64,
    pub pad_token_id: Option<i64>,
    pub max_length: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            decoder_start_token_id: 2,
            eos_token_id: 2,
            pad_token_id: Some(1),
            max_length: DEFAULT_MAX_LENGTH,
        }
    }
}

impl GenerationConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open model config at {:?}", path))?;
        serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse model config at {:?}", path))
    }
}

/// Index of the highest logit; ties resolve to the later index.
pub fn argmax(logits: &[f32]) -> Option<usize> {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(index, _)| index)
}

#[derive(Debug)]
pub struct TrOcr {
    encoder_model: Session,
    decoder_model: Session,
    tokenizer: Tokenizer,
    processor: ImageProcessor,
    generation: GenerationConfig,
}

impl TrOcr {
    pub fn new(repo_id: &str) -> anyhow::Result<Self> {
        let api = Api::new()?;
        let repo = api.model(repo_id.to_string());
        let encoder_model_path = repo.get("onnx/encoder_model.onnx")?;
        let decoder_model_path = repo.get("onnx/decoder_model.onnx")?;
        let tokenizer_path = repo.get("tokenizer.json")?;
        let processor_path = repo.get("preprocessor_config.json")?;
        let config_path = repo.get("config.json")?;

        tracing::info!(repo = repo_id, "loading TrOCR sessions");

        let encoder_model = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(thread::available_parallelism()?.get())?
            .commit_from_file(encoder_model_path)?;

        let decoder_model = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(thread::available_parallelism()?.get())?
            .commit_from_file(decoder_model_path)?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {e}"))?;

        Ok(Self {
            encoder_model,
            decoder_model,
            tokenizer,
            processor: ImageProcessor::from_file(&processor_path)?,
            generation: GenerationConfig::from_file(&config_path)?,
        })
    }

    pub fn set_max_length(&mut self, max_length: usize) {
        self.generation.max_length = max_length;
    }

    pub fn preprocess(&self, image: &image::DynamicImage) -> Array4<f32> {
        self.processor.preprocess(image)
    }

    /// Greedy autoregressive decoding over the encoder hidden states.
    pub fn generate(&mut self, pixel_values: Array4<f32>) -> anyhow::Result<Vec<i64>> {
        let outputs = self
            .encoder_model
            .run(inputs!["pixel_values" => Tensor::from_array(pixel_values)?])?;
        let (shape, hidden) = outputs[0].try_extract_tensor::<f32>()?;
        let hidden_shape = shape.iter().map(|&d| d as usize).collect::<Vec<_>>();
        let encoder_hidden_states = Tensor::from_array((hidden_shape, hidden.to_vec()))?;
        drop(outputs);

        let mut token_ids = vec![self.generation.decoder_start_token_id];

        while token_ids.len() < self.generation.max_length {
            let input_ids = Tensor::from_array(([1, token_ids.len()], token_ids.clone()))?;
            let outputs = self.decoder_model.run(inputs![
                "input_ids" => input_ids,
                "encoder_hidden_states" => encoder_hidden_states.view(),
            ])?;

            let (shape, logits) = outputs["logits"].try_extract_tensor::<f32>()?;
            let vocab_size = shape[shape.len() - 1] as usize;
            let last_token_logits = &logits[logits.len() - vocab_size..];
            let token_id = argmax(last_token_logits)
                .ok_or_else(|| anyhow::anyhow!("Decoder returned empty logits"))?
                as i64;

            token_ids.push(token_id);

            if token_id == self.generation.eos_token_id {
                break;
            }
        }

        tracing::debug!(tokens = token_ids.len(), "generation finished");

        Ok(token_ids)
    }

    pub fn decode(&self, token_ids: &[i64]) -> anyhow::Result<String> {
        let ids = token_ids
            .iter()
            .filter(|&&id| id >= 0)
            .map(|&id| id as u32)
            .collect::<Vec<_>>();

        self.tokenizer
            .decode(&ids, true)
            .map_err(|e| anyhow::anyhow!("Failed to decode tokens: {e}"))
    }

    pub fn inference(&mut self, image: &image::DynamicImage) -> anyhow::Result<String> {
        let pixel_values = self.preprocess(image);
        let token_ids = self.generate(pixel_values)?;
        self.decode(&token_ids)
    }
}
