use std::collections::BTreeSet;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

pub const IMAGE_EXTENSION: &str = "JPG";

/// One manifest entry: an image on disk and its transcription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub path: PathBuf,
    pub label: String,
}

impl Sample {
    pub fn new(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
        }
    }
}

/// Result of scanning a label file.
#[derive(Debug, Clone, Default)]
pub struct DatasetScan {
    pub samples: Vec<Sample>,
    pub vocab: BTreeSet<char>,
    pub max_len: usize,
}

impl DatasetScan {
    /// Vocabulary in sorted order, as stored in the model configs.
    pub fn vocab_string(&self) -> String {
        self.vocab.iter().collect()
    }
}

/// Reads `filename,transcription` lines after a header line, keeping only
/// entries whose `<images_dir>/<filename>.JPG` exists.
pub fn scan_label_file(label_file: &Path, images_dir: &Path) -> Result<DatasetScan> {
    anyhow::ensure!(
        images_dir.is_dir(),
        "Images directory {:?} does not exist",
        images_dir
    );

    let file = fs::File::open(label_file)
        .with_context(|| format!("Failed to open label file at {:?}", label_file))?;
    let mut lines = BufReader::new(file).lines();

    // header
    if let Some(header) = lines.next() {
        header.with_context(|| format!("Failed to read label file at {:?}", label_file))?;
    }

    let progress = ProgressBar::new_spinner();
    progress.set_style(ProgressStyle::with_template("{spinner} {msg} {pos} lines")?);
    progress.set_message("scanning labels");

    let mut scan = DatasetScan::default();
    for line in lines {
        let line = line.with_context(|| format!("Failed to read label file at {:?}", label_file))?;
        progress.inc(1);

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some((file_name, label)) = line.split_once(',') else {
            tracing::warn!("Malformed label line skipped: {line}");
            continue;
        };

        let path = images_dir.join(format!("{file_name}.{IMAGE_EXTENSION}"));
        if !path.exists() {
            tracing::warn!("File not found: {:?}", path);
            continue;
        }

        tracing::debug!(label, "accepted sample");
        scan.vocab.extend(label.chars());
        scan.max_len = scan.max_len.max(label.chars().count());
        scan.samples.push(Sample::new(path, label));
    }
    progress.finish_and_clear();

    tracing::info!("Dataset size: {}", scan.samples.len());
    tracing::info!("Vocabulary: {:?}", scan.vocab_string());
    tracing::info!("Max label length: {}", scan.max_len);

    Ok(scan)
}

/// Writes the manifest as a two column `path,label` CSV.
pub fn write_manifest_csv(path: &Path, samples: &[Sample]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create manifest at {:?}", path))?;
    if samples.is_empty() {
        writer.write_record(["path", "label"])?;
    }
    for sample in samples {
        writer.serialize(sample)?;
    }
    writer.flush()?;

    Ok(())
}

pub fn read_manifest_csv(path: &Path) -> Result<Vec<Sample>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to read manifest at {:?}", path))?;
    reader
        .deserialize::<Sample>()
        .map(|record| record.with_context(|| format!("Malformed manifest record in {:?}", path)))
        .collect()
}
