//! Hooks run by [`crate::trainer::Trainer::fit`] around each epoch.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};

use crate::package::write_checksums;

/// Metrics of one finished epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochLogs {
    pub epoch: usize,
    pub loss: f64,
    #[serde(rename = "CER")]
    pub cer: f64,
    #[serde(rename = "WER")]
    pub wer: f64,
    pub val_loss: f64,
    #[serde(rename = "val_CER")]
    pub val_cer: f64,
    #[serde(rename = "val_WER")]
    pub val_wer: f64,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monitor {
    Loss,
    ValLoss,
    ValCer,
    ValWer,
}

impl Monitor {
    pub fn name(&self) -> &'static str {
        match self {
            Monitor::Loss => "loss",
            Monitor::ValLoss => "val_loss",
            Monitor::ValCer => "val_CER",
            Monitor::ValWer => "val_WER",
        }
    }

    pub fn value(&self, logs: &EpochLogs) -> f64 {
        match self {
            Monitor::Loss => logs.loss,
            Monitor::ValLoss => logs.val_loss,
            Monitor::ValCer => logs.val_cer,
            Monitor::ValWer => logs.val_wer,
        }
    }
}

/// Tracks the best value of a monitored metric where lower is better.
#[derive(Debug, Clone)]
struct BestTracker {
    monitor: Monitor,
    min_delta: f64,
    best: f64,
}

impl BestTracker {
    fn new(monitor: Monitor, min_delta: f64) -> Self {
        Self {
            monitor,
            min_delta,
            best: f64::INFINITY,
        }
    }

    /// Returns the previous best when `logs` improves on it.
    fn update(&mut self, logs: &EpochLogs) -> Option<f64> {
        let current = self.monitor.value(logs);
        if current < self.best - self.min_delta {
            let previous = self.best;
            self.best = current;
            Some(previous)
        } else {
            None
        }
    }
}

/// Mutable training state exposed to callbacks.
pub struct TrainingContext<'a> {
    pub varmap: &'a VarMap,
    pub learning_rate: f64,
    pub stop_training: bool,
}

pub trait Callback {
    fn on_train_begin(&mut self, _ctx: &mut TrainingContext) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, logs: &EpochLogs, ctx: &mut TrainingContext) -> Result<()>;

    fn on_train_end(&mut self, _ctx: &mut TrainingContext) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EarlyStopping {
    tracker: BestTracker,
    patience: usize,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(monitor: Monitor, patience: usize) -> Self {
        Self {
            tracker: BestTracker::new(monitor, 0.0),
            patience,
            wait: 0,
        }
    }
}

impl Callback for EarlyStopping {
    fn on_epoch_end(&mut self, logs: &EpochLogs, ctx: &mut TrainingContext) -> Result<()> {
        if self.tracker.update(logs).is_some() {
            self.wait = 0;
            return Ok(());
        }

        self.wait += 1;
        if self.wait >= self.patience {
            tracing::info!(
                "Epoch {}: early stopping, {} did not improve for {} epochs",
                logs.epoch,
                self.tracker.monitor.name(),
                self.wait
            );
            ctx.stop_training = true;
        }
        Ok(())
    }
}

/// Saves the weights whenever the monitored metric improves.
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    path: PathBuf,
    tracker: BestTracker,
}

impl ModelCheckpoint {
    pub fn new(path: impl Into<PathBuf>, monitor: Monitor) -> Self {
        Self {
            path: path.into(),
            tracker: BestTracker::new(monitor, 0.0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Callback for ModelCheckpoint {
    fn on_epoch_end(&mut self, logs: &EpochLogs, ctx: &mut TrainingContext) -> Result<()> {
        if let Some(previous) = self.tracker.update(logs) {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            ctx.varmap
                .save(&self.path)
                .with_context(|| format!("Failed to save checkpoint to {:?}", self.path))?;
            tracing::info!(
                "Epoch {}: {} improved from {:.5} to {:.5}, saving model to {:?}",
                logs.epoch,
                self.tracker.monitor.name(),
                previous,
                self.tracker.best,
                self.path
            );
        }
        Ok(())
    }
}

/// Appends one human readable line per epoch to `logs.log`.
#[derive(Debug, Clone)]
pub struct TrainLogger {
    path: PathBuf,
}

impl TrainLogger {
    pub fn new(model_path: &Path) -> Self {
        Self {
            path: model_path.join("logs.log"),
        }
    }
}

impl Callback for TrainLogger {
    fn on_epoch_end(&mut self, logs: &EpochLogs, _ctx: &mut TrainingContext) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open training log {:?}", self.path))?;
        writeln!(
            file,
            "Epoch {}; loss: {}; CER: {}; WER: {}; val_loss: {}; val_CER: {}; val_WER: {}; lr: {}",
            logs.epoch,
            logs.loss,
            logs.cer,
            logs.wer,
            logs.val_loss,
            logs.val_cer,
            logs.val_wer,
            logs.learning_rate
        )?;
        Ok(())
    }
}

/// Structured per-epoch metrics as JSON lines under `<model>/logs/`.
#[derive(Debug, Clone)]
pub struct MetricsLog {
    path: PathBuf,
}

impl MetricsLog {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            path: log_dir.join("metrics.jsonl"),
        }
    }

    pub fn read(path: &Path) -> Result<Vec<EpochLogs>> {
        fs::read_to_string(path)
            .with_context(|| format!("Failed to read metrics log {:?}", path))?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }
}

impl Callback for MetricsLog {
    fn on_train_begin(&mut self, _ctx: &mut TrainingContext) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, b"")?;
        Ok(())
    }

    fn on_epoch_end(&mut self, logs: &EpochLogs, _ctx: &mut TrainingContext) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(logs)?)?;
        Ok(())
    }
}

/// Multiplies the learning rate by `factor` after `patience` epochs without improvement.
#[derive(Debug, Clone)]
pub struct ReduceLROnPlateau {
    tracker: BestTracker,
    factor: f64,
    patience: usize,
    min_lr: f64,
    wait: usize,
}

impl ReduceLROnPlateau {
    pub fn new(monitor: Monitor, factor: f64, patience: usize, min_delta: f64) -> Self {
        Self {
            tracker: BestTracker::new(monitor, min_delta),
            factor,
            patience,
            min_lr: 0.0,
            wait: 0,
        }
    }
}

impl Callback for ReduceLROnPlateau {
    fn on_epoch_end(&mut self, logs: &EpochLogs, ctx: &mut TrainingContext) -> Result<()> {
        if self.tracker.update(logs).is_some() {
            self.wait = 0;
            return Ok(());
        }

        self.wait += 1;
        if self.wait >= self.patience && ctx.learning_rate > self.min_lr {
            let reduced = (ctx.learning_rate * self.factor).max(self.min_lr);
            tracing::info!(
                "Epoch {}: ReduceLROnPlateau reducing learning rate to {}",
                logs.epoch,
                reduced
            );
            ctx.learning_rate = reduced;
            self.wait = 0;
        }
        Ok(())
    }
}

const PLOT_WIDTH: u32 = 800;
const PLOT_HEIGHT: u32 = 300;
const PLOT_MARGIN: u32 = 20;
const TRAIN_COLOR: Rgb<u8> = Rgb([31, 119, 180]);
const VAL_COLOR: Rgb<u8> = Rgb([255, 127, 14]);

/// Redraws loss and CER curves (training blue, validation orange) after every epoch.
#[derive(Debug, Clone)]
pub struct CurvePlot {
    path: PathBuf,
    history: Vec<EpochLogs>,
}

impl CurvePlot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            history: Vec::new(),
        }
    }

    fn draw_panel(canvas: &mut RgbImage, top: u32, series: [(Vec<f64>, Rgb<u8>); 2]) {
        let left = PLOT_MARGIN;
        let width = PLOT_WIDTH - 2 * PLOT_MARGIN;
        let height = PLOT_HEIGHT - 2 * PLOT_MARGIN;
        let frame = Rect::at(left as i32, top as i32).of_size(width, height);
        draw_hollow_rect_mut(canvas, frame, Rgb([0, 0, 0]));

        let max = series
            .iter()
            .flat_map(|(values, _)| values.iter().copied())
            .filter(|v| v.is_finite())
            .fold(f64::MIN_POSITIVE, f64::max);

        for (legend, (values, color)) in series.iter().enumerate() {
            let swatch = Rect::at((left + 8 + 24 * legend as u32) as i32, (top + 8) as i32).of_size(16, 6);
            draw_filled_rect_mut(canvas, swatch, *color);

            let steps = values.len().saturating_sub(1).max(1) as f32;
            let point = |i: usize, v: f64| {
                let v = if v.is_finite() { v } else { max };
                (
                    left as f32 + width as f32 * i as f32 / steps,
                    (top + height) as f32 - height as f32 * (v / max).clamp(0.0, 1.0) as f32,
                )
            };
            for (i, pair) in values.windows(2).enumerate() {
                draw_line_segment_mut(canvas, point(i, pair[0]), point(i + 1, pair[1]), *color);
            }
        }
    }

    pub fn render(&self) -> RgbImage {
        let mut canvas = RgbImage::from_pixel(PLOT_WIDTH, 2 * PLOT_HEIGHT, Rgb([255, 255, 255]));
        let collect = |f: fn(&EpochLogs) -> f64| self.history.iter().map(f).collect::<Vec<_>>();

        Self::draw_panel(
            &mut canvas,
            PLOT_MARGIN,
            [(collect(|l| l.loss), TRAIN_COLOR), (collect(|l| l.val_loss), VAL_COLOR)],
        );
        Self::draw_panel(
            &mut canvas,
            PLOT_HEIGHT + PLOT_MARGIN,
            [(collect(|l| l.cer), TRAIN_COLOR), (collect(|l| l.val_cer), VAL_COLOR)],
        );
        canvas
    }
}

impl Callback for CurvePlot {
    fn on_epoch_end(&mut self, logs: &EpochLogs, _ctx: &mut TrainingContext) -> Result<()> {
        self.history.push(*logs);
        self.render()
            .save(&self.path)
            .with_context(|| format!("Failed to save training curves to {:?}", self.path))
    }
}

/// After training, re-saves the best checkpoint as standalone f32 CPU weights
/// and records SHA-256 checksums of the exported artifacts.
#[derive(Debug, Clone)]
pub struct ModelExport {
    checkpoint: PathBuf,
    export: PathBuf,
}

impl ModelExport {
    pub fn new(checkpoint: impl Into<PathBuf>, export: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint: checkpoint.into(),
            export: export.into(),
        }
    }

    pub fn export(&self) -> Result<()> {
        let tensors = candle_core::safetensors::load(&self.checkpoint, &Device::Cpu)
            .with_context(|| format!("Failed to load checkpoint {:?}", self.checkpoint))?;
        let tensors = tensors
            .into_iter()
            .map(|(name, tensor)| Ok((name, tensor.to_dtype(DType::F32)?.contiguous()?)))
            .collect::<Result<HashMap<String, Tensor>>>()?;

        candle_core::safetensors::save(&tensors, &self.export)
            .with_context(|| format!("Failed to export model to {:?}", self.export))?;

        if let Some(model_dir) = self.export.parent() {
            write_checksums(model_dir)?;
        }
        tracing::info!("exported {} tensors to {:?}", tensors.len(), self.export);
        Ok(())
    }
}

impl Callback for ModelExport {
    fn on_epoch_end(&mut self, _logs: &EpochLogs, _ctx: &mut TrainingContext) -> Result<()> {
        Ok(())
    }

    fn on_train_end(&mut self, _ctx: &mut TrainingContext) -> Result<()> {
        if !self.checkpoint.exists() {
            tracing::warn!("No checkpoint at {:?}, skipping export", self.checkpoint);
            return Ok(());
        }
        self.export()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::Init;

    fn logs(epoch: usize, val_cer: f64) -> EpochLogs {
        EpochLogs {
            epoch,
            loss: 10.0 / epoch as f64,
            cer: 0.5,
            wer: 0.9,
            val_loss: 12.0 / epoch as f64,
            val_cer,
            val_wer: 0.95,
            learning_rate: 0.001,
        }
    }

    fn run(callback: &mut dyn Callback, ctx: &mut TrainingContext, values: &[f64]) -> Vec<bool> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                callback.on_epoch_end(&logs(i + 1, v), ctx).unwrap();
                ctx.stop_training
            })
            .collect()
    }

    #[test]
    fn test_early_stopping_waits_for_patience() {
        let varmap = VarMap::new();
        let mut ctx = TrainingContext { varmap: &varmap, learning_rate: 0.001, stop_training: false };
        let mut stopper = EarlyStopping::new(Monitor::ValCer, 2);

        let stops = run(&mut stopper, &mut ctx, &[0.5, 0.4, 0.45, 0.41]);
        assert_eq!(stops, vec![false, false, false, true]);
    }

    #[test]
    fn test_reduce_lr_on_plateau() {
        let varmap = VarMap::new();
        let mut ctx = TrainingContext { varmap: &varmap, learning_rate: 1.0, stop_training: false };
        let mut reducer = ReduceLROnPlateau::new(Monitor::ValCer, 0.9, 2, 1e-10);

        run(&mut reducer, &mut ctx, &[0.5, 0.5, 0.5]);
        assert!((ctx.learning_rate - 0.9).abs() < 1e-12);
        run(&mut reducer, &mut ctx, &[0.5, 0.4]);
        assert!((ctx.learning_rate - 0.9).abs() < 1e-12);
        assert!(!ctx.stop_training);
    }

    #[test]
    fn test_checkpoint_saves_only_on_improvement_and_exports() {
        let dir = tempfile::tempdir().unwrap();
        let varmap = VarMap::new();
        varmap
            .get((2, 2), "head.weight", Init::Const(1.0), DType::F32, &Device::Cpu)
            .unwrap();
        let mut ctx = TrainingContext { varmap: &varmap, learning_rate: 0.001, stop_training: false };

        let checkpoint_path = dir.path().join("model.safetensors");
        let mut checkpoint = ModelCheckpoint::new(&checkpoint_path, Monitor::ValCer);
        checkpoint.on_epoch_end(&logs(1, 0.8), &mut ctx).unwrap();
        let first = fs::metadata(&checkpoint_path).unwrap().modified().unwrap();
        checkpoint.on_epoch_end(&logs(2, 0.9), &mut ctx).unwrap();
        assert_eq!(fs::metadata(&checkpoint_path).unwrap().modified().unwrap(), first);

        let export_path = dir.path().join("exported.safetensors");
        let mut export = ModelExport::new(&checkpoint_path, &export_path);
        export.on_train_end(&mut ctx).unwrap();

        let exported = candle_core::safetensors::load(&export_path, &Device::Cpu).unwrap();
        assert_eq!(exported["head.weight"].dims(), &[2, 2]);
        assert!(dir.path().join("checksums.json").exists());
    }

    #[test]
    fn test_loggers_write_every_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let varmap = VarMap::new();
        let mut ctx = TrainingContext { varmap: &varmap, learning_rate: 0.001, stop_training: false };

        let mut logger = TrainLogger::new(dir.path());
        let mut metrics = MetricsLog::new(&dir.path().join("logs"));
        let mut plot = CurvePlot::new(dir.path().join("training_curves.png"));
        metrics.on_train_begin(&mut ctx).unwrap();
        for epoch in 1..=3 {
            let epoch_logs = logs(epoch, 0.5);
            logger.on_epoch_end(&epoch_logs, &mut ctx).unwrap();
            metrics.on_epoch_end(&epoch_logs, &mut ctx).unwrap();
            plot.on_epoch_end(&epoch_logs, &mut ctx).unwrap();
        }

        let text = fs::read_to_string(dir.path().join("logs.log")).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("Epoch 1; loss: 10;"));

        let history = MetricsLog::read(&dir.path().join("logs/metrics.jsonl")).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2], logs(3, 0.5));

        let curves = image::open(dir.path().join("training_curves.png")).unwrap();
        assert_eq!(curves.width(), PLOT_WIDTH);
    }

    #[test]
    fn test_epoch_logs_use_metric_names() {
        let json = serde_json::to_value(logs(1, 0.25)).unwrap();
        assert_eq!(json["val_CER"], 0.25);
        assert!(json.get("val_cer").is_none());
    }
}
