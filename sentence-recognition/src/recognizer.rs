use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, ModuleT, Tensor};
use candle_nn::VarBuilder;
use image::DynamicImage;

use crate::config::ModelConfigs;
use crate::ctc::greedy_decode;
use crate::model::Crnn;
use crate::package::ModelPackage;
use crate::transformers::ImageResizer;

/// Loads a trained model directory and transcribes single line images.
pub struct SentenceRecognizer {
    model: Crnn,
    configs: ModelConfigs,
    vocab: Vec<char>,
    resizer: ImageResizer,
    device: Device,
}

impl SentenceRecognizer {
    pub fn from_dir(model_dir: &Path, device: Device) -> Result<Self> {
        let package = ModelPackage::from_dir(model_dir)?;
        tracing::info!("loading weights from {:?}", package.weights);

        let tensors = candle_core::safetensors::load(&package.weights, &device)
            .with_context(|| format!("Failed to load weights from {:?}", package.weights))?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);

        let configs = package.configs;
        let vocab = configs.vocab_chars();
        let model = Crnn::new(vb, configs.height, vocab.len() + 1)?;
        let resizer = ImageResizer::new(configs.width, configs.height, true);

        Ok(Self {
            model,
            vocab,
            resizer,
            configs,
            device,
        })
    }

    pub fn configs(&self) -> &ModelConfigs {
        &self.configs
    }

    fn to_tensor(&self, image: &DynamicImage) -> Result<Tensor> {
        let image = self.resizer.resize(&image.to_rgb8());
        let (width, height) = image.dimensions();
        let data = image.into_raw();

        let tensor = Tensor::from_vec(data, (height as usize, width as usize, 3), &self.device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?
            .unsqueeze(0)?;
        Ok(tensor)
    }

    pub fn predict(&self, image: &DynamicImage) -> Result<String> {
        let input = self.to_tensor(image)?;
        let log_probs = self.model.forward_t(&input, false)?;
        let mut texts = greedy_decode(&log_probs, &self.vocab)?;
        Ok(texts.pop().unwrap_or_default())
    }
}
