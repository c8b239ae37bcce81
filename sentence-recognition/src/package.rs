use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::config::{CONFIG_FILE_NAME, ModelConfigs};

pub const CHECKPOINT_FILE_NAME: &str = "model.safetensors";
pub const EXPORT_FILE_NAME: &str = "exported.safetensors";
pub const FINAL_FILE_NAME: &str = "final.safetensors";
pub const CHECKSUMS_FILE_NAME: &str = "checksums.json";

const CHECKSUMMED_FILES: [&str; 2] = [EXPORT_FILE_NAME, CONFIG_FILE_NAME];

fn sha256_hex(path: &Path) -> Result<String> {
    let content = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    Ok(format!("{:x}", Sha256::digest(&content)))
}

/// SHA-256 of the exported weights and config, for whichever of them exist.
pub fn generate_checksums(model_dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut checksums = BTreeMap::new();
    for filename in CHECKSUMMED_FILES {
        let path = model_dir.join(filename);
        if path.exists() {
            checksums.insert(filename.to_string(), sha256_hex(&path)?);
        }
    }
    Ok(checksums)
}

pub fn write_checksums(model_dir: &Path) -> Result<()> {
    let checksums = generate_checksums(model_dir)?;
    let path = model_dir.join(CHECKSUMS_FILE_NAME);
    fs::write(&path, serde_json::to_string_pretty(&checksums)?)
        .with_context(|| format!("Failed to write checksums at {:?}", path))
}

pub fn validate_checksums(model_dir: &Path, checksums: &BTreeMap<String, String>) -> Result<()> {
    for (filename, expected) in checksums {
        let path = model_dir.join(filename);
        if !path.exists() {
            continue;
        }
        let actual = sha256_hex(&path)?;
        if &actual != expected {
            anyhow::bail!("Checksum mismatch for {filename}: expected {expected}, got {actual}");
        }
    }
    Ok(())
}

/// A trained model directory: configs plus the weights to load.
#[derive(Debug, Clone)]
pub struct ModelPackage {
    pub configs: ModelConfigs,
    pub weights: PathBuf,
    pub checksums: BTreeMap<String, String>,
}

impl ModelPackage {
    /// Prefers the exported weights, falling back to the best checkpoint.
    pub fn from_dir(model_dir: &Path) -> Result<Self> {
        let configs = ModelConfigs::load(&model_dir.join(CONFIG_FILE_NAME))?;

        let checksums_path = model_dir.join(CHECKSUMS_FILE_NAME);
        let checksums: BTreeMap<String, String> = if checksums_path.exists() {
            serde_json::from_reader(
                fs::File::open(&checksums_path)
                    .with_context(|| format!("Failed to open checksums at {:?}", checksums_path))?,
            )
            .with_context(|| format!("Failed to parse checksums at {:?}", checksums_path))?
        } else {
            BTreeMap::new()
        };
        validate_checksums(model_dir, &checksums)?;

        let weights = [EXPORT_FILE_NAME, CHECKPOINT_FILE_NAME, FINAL_FILE_NAME]
            .iter()
            .map(|name| model_dir.join(name))
            .find(|path| path.exists())
            .ok_or_else(|| anyhow::anyhow!("No model weights found in {:?}", model_dir))?;

        Ok(Self {
            configs,
            weights,
            checksums,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let configs = ModelConfigs {
            model_path: dir.path().to_path_buf(),
            vocab: "ab".to_string(),
            ..Default::default()
        };
        configs.save().unwrap();
        dir
    }

    #[test]
    fn test_package_prefers_exported_weights() {
        let dir = model_dir();
        fs::write(dir.path().join(CHECKPOINT_FILE_NAME), b"checkpoint").unwrap();
        fs::write(dir.path().join(EXPORT_FILE_NAME), b"export").unwrap();
        write_checksums(dir.path()).unwrap();

        let package = ModelPackage::from_dir(dir.path()).unwrap();
        assert_eq!(package.weights, dir.path().join(EXPORT_FILE_NAME));
        assert_eq!(package.checksums.len(), 2);
        assert_eq!(package.configs.vocab, "ab");
    }

    #[test]
    fn test_tampered_export_is_rejected() {
        let dir = model_dir();
        fs::write(dir.path().join(EXPORT_FILE_NAME), b"export").unwrap();
        write_checksums(dir.path()).unwrap();
        fs::write(dir.path().join(EXPORT_FILE_NAME), b"tampered").unwrap();

        let err = ModelPackage::from_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Checksum mismatch"));
    }

    #[test]
    fn test_missing_weights_is_an_error() {
        let dir = model_dir();
        assert!(ModelPackage::from_dir(dir.path()).is_err());
    }
}
