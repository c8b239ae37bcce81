use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "configs.json";

/// Training configuration, persisted next to the model artifacts so that
/// prediction and export can recover the vocabulary and input size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfigs {
    pub model_path: PathBuf,
    pub vocab: String,
    pub height: u32,
    pub width: u32,
    pub max_text_length: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub train_epochs: usize,
    pub train_workers: usize,
}

impl Default for ModelConfigs {
    fn default() -> Self {
        let stamp = chrono::Local::now().format("%Y%m%d%H%M").to_string();
        Self {
            model_path: Path::new("Models/04_sentence_recognition").join(stamp),
            vocab: String::new(),
            height: 96,
            width: 1408,
            max_text_length: 0,
            batch_size: 32,
            learning_rate: 0.0005,
            train_epochs: 1000,
            train_workers: 20,
        }
    }
}

impl ModelConfigs {
    pub fn vocab_chars(&self) -> Vec<char> {
        self.vocab.chars().collect()
    }

    /// Padding value and CTC blank share the index one past the vocabulary.
    pub fn blank_index(&self) -> u32 {
        self.vocab.chars().count() as u32
    }

    pub fn config_path(&self) -> PathBuf {
        self.model_path.join(CONFIG_FILE_NAME)
    }

    pub fn save(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.model_path)
            .with_context(|| format!("Failed to create model directory {:?}", self.model_path))?;

        let path = self.config_path();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).with_context(|| format!("Failed to write config at {:?}", path))?;

        tracing::info!("saved model configs to {:?}", path);
        Ok(path)
    }

    /// Accepts either the config file itself or the model directory holding it.
    pub fn load(path: &Path) -> Result<Self> {
        let path = if path.is_dir() {
            path.join(CONFIG_FILE_NAME)
        } else {
            path.to_path_buf()
        };

        let file = fs::File::open(&path)
            .with_context(|| format!("Failed to open config file at {:?}", path))?;
        serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse config file at {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_sentence_tutorial() {
        let configs = ModelConfigs::default();
        assert_eq!((configs.height, configs.width), (96, 1408));
        assert_eq!(configs.batch_size, 32);
        assert_eq!(configs.learning_rate, 0.0005);
        assert!(configs.model_path.starts_with("Models/04_sentence_recognition"));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let configs = ModelConfigs {
            model_path: dir.path().join("run"),
            vocab: "catdog".to_string(),
            max_text_length: 3,
            ..Default::default()
        };

        let saved = configs.save().unwrap();
        assert!(saved.exists());

        let from_dir = ModelConfigs::load(&configs.model_path).unwrap();
        let from_file = ModelConfigs::load(&saved).unwrap();
        assert_eq!(from_dir, configs);
        assert_eq!(from_file.vocab, "catdog");
        assert_eq!(from_file.max_text_length, 3);
    }

    #[test]
    fn test_blank_index_follows_vocab() {
        let configs = ModelConfigs {
            vocab: "ab ".to_string(),
            ..Default::default()
        };
        assert_eq!(configs.blank_index(), 3);
        assert_eq!(configs.vocab_chars(), vec!['a', 'b', ' ']);
    }

    #[test]
    fn test_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ModelConfigs::load(dir.path()).is_err());
    }
}
