use anyhow::Result;
use candle_core::{DType, Device, ModuleT};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};

use crate::accuracy::BatchAccuracy;
use crate::callbacks::{Callback, EpochLogs, TrainingContext};
use crate::config::ModelConfigs;
use crate::ctc::{ctc_loss, greedy_decode};
use crate::model::Crnn;
use crate::provider::DataProvider;

/// CUDA device 0 when compiled in and present, CPU otherwise.
pub fn select_device() -> Device {
    match Device::cuda_if_available(0) {
        Ok(device) => device,
        Err(e) => {
            tracing::debug!("CUDA unavailable, falling back to CPU: {e}");
            Device::Cpu
        }
    }
}

/// Mean loss and error rates over one pass of a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseMetrics {
    pub loss: f64,
    pub cer: f64,
    pub wer: f64,
}

pub struct Trainer {
    model: Crnn,
    varmap: VarMap,
    optimizer: AdamW,
    vocab: Vec<char>,
    blank: u32,
    device: Device,
    pool: rayon::ThreadPool,
}

impl Trainer {
    pub fn new(configs: &ModelConfigs, device: Device) -> Result<Self> {
        let vocab = configs.vocab_chars();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = Crnn::new(vb, configs.height, vocab.len() + 1)?;

        // weight_decay 0 makes AdamW plain Adam
        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: configs.learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(configs.train_workers.max(1))
            .thread_name(|i| format!("loader-{i}"))
            .build()?;

        Ok(Self {
            model,
            varmap,
            optimizer,
            blank: configs.blank_index(),
            vocab,
            device,
            pool,
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn parameter_count(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|var| var.elem_count())
            .sum()
    }

    fn progress_bar(len: usize, message: String) -> Result<ProgressBar> {
        let progress = ProgressBar::new(len as u64);
        progress.set_style(ProgressStyle::with_template(
            "{msg} [{bar:40}] {pos}/{len} ({eta})",
        )?);
        progress.set_message(message);
        Ok(progress)
    }

    fn train_epoch(&mut self, provider: &DataProvider, message: String) -> Result<PhaseMetrics> {
        let batches = provider.epoch_batches();
        let progress = Self::progress_bar(batches.len(), message)?;
        let mut loss_sum = 0.0;
        let mut accuracy = BatchAccuracy::new();

        for indices in &batches {
            let batch = provider.load_batch(indices, &self.device, &self.pool)?;
            let log_probs = self.model.forward_t(&batch.images, true)?;
            let loss = ctc_loss(&log_probs, &batch.labels, self.blank)?;
            self.optimizer.backward_step(&loss)?;

            loss_sum += loss.to_scalar::<f32>()? as f64;
            for (text, predicted) in batch.texts.iter().zip(greedy_decode(&log_probs, &self.vocab)?) {
                accuracy.push(text, &predicted);
            }
            progress.inc(1);
        }
        progress.finish_and_clear();

        Ok(PhaseMetrics {
            loss: loss_sum / batches.len().max(1) as f64,
            cer: accuracy.average_cer(),
            wer: accuracy.average_wer(),
        })
    }

    /// Loss and CER/WER of the current weights on `provider`, without updates.
    pub fn evaluate(&self, provider: &DataProvider) -> Result<PhaseMetrics> {
        let batches = provider.epoch_batches();
        let mut loss_sum = 0.0;
        let mut accuracy = BatchAccuracy::new();

        for indices in &batches {
            let batch = provider.load_batch(indices, &self.device, &self.pool)?;
            let log_probs = self.model.forward_t(&batch.images, false)?.detach();
            let loss = ctc_loss(&log_probs, &batch.labels, self.blank)?;

            loss_sum += loss.to_scalar::<f32>()? as f64;
            for (text, predicted) in batch.texts.iter().zip(greedy_decode(&log_probs, &self.vocab)?) {
                accuracy.push(text, &predicted);
            }
        }

        Ok(PhaseMetrics {
            loss: loss_sum / batches.len().max(1) as f64,
            cer: accuracy.average_cer(),
            wer: accuracy.average_wer(),
        })
    }

    /// Runs up to `epochs` epochs, stopping early when a callback asks to.
    pub fn fit(
        &mut self,
        train: &DataProvider,
        val: &DataProvider,
        epochs: usize,
        callbacks: &mut [Box<dyn Callback>],
    ) -> Result<Vec<EpochLogs>> {
        let mut ctx = TrainingContext {
            varmap: &self.varmap,
            learning_rate: self.optimizer.learning_rate(),
            stop_training: false,
        };
        for callback in callbacks.iter_mut() {
            callback.on_train_begin(&mut ctx)?;
        }

        let mut history = Vec::new();
        for epoch in 1..=epochs {
            let train_metrics = self.train_epoch(train, format!("Epoch {epoch}/{epochs}"))?;
            let val_metrics = self.evaluate(val)?;

            let logs = EpochLogs {
                epoch,
                loss: train_metrics.loss,
                cer: train_metrics.cer,
                wer: train_metrics.wer,
                val_loss: val_metrics.loss,
                val_cer: val_metrics.cer,
                val_wer: val_metrics.wer,
                learning_rate: self.optimizer.learning_rate(),
            };
            tracing::info!(
                "Epoch {}/{}: loss={:.4} CER={:.4} WER={:.4} val_loss={:.4} val_CER={:.4} val_WER={:.4}",
                epoch,
                epochs,
                logs.loss,
                logs.cer,
                logs.wer,
                logs.val_loss,
                logs.val_cer,
                logs.val_wer
            );

            let mut ctx = TrainingContext {
                varmap: &self.varmap,
                learning_rate: logs.learning_rate,
                stop_training: false,
            };
            for callback in callbacks.iter_mut() {
                callback.on_epoch_end(&logs, &mut ctx)?;
            }
            let (learning_rate, stop_training) = (ctx.learning_rate, ctx.stop_training);

            if learning_rate != logs.learning_rate {
                self.optimizer.set_learning_rate(learning_rate);
            }
            history.push(logs);
            if stop_training {
                break;
            }
        }

        let mut ctx = TrainingContext {
            varmap: &self.varmap,
            learning_rate: self.optimizer.learning_rate(),
            stop_training: true,
        };
        for callback in callbacks.iter_mut() {
            callback.on_train_end(&mut ctx)?;
        }

        Ok(history)
    }
}
