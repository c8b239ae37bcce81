use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sentence_recognition::accuracy::BatchAccuracy;
use sentence_recognition::augmentors::{Augmentor, RandomBrightness, RandomErodeDilate, RandomSharpen};
use sentence_recognition::callbacks::{
    Callback, CurvePlot, EarlyStopping, MetricsLog, ModelCheckpoint, ModelExport, Monitor,
    ReduceLROnPlateau, TrainLogger,
};
use sentence_recognition::config::ModelConfigs;
use sentence_recognition::dataset::{read_manifest_csv, scan_label_file};
use sentence_recognition::package::{CHECKPOINT_FILE_NAME, EXPORT_FILE_NAME, FINAL_FILE_NAME};
use sentence_recognition::provider::{DataProvider, Transformers};
use sentence_recognition::recognizer::SentenceRecognizer;
use sentence_recognition::trainer::{Trainer, select_device};
use sentence_recognition::transformers::{ImageResizer, LabelIndexer, LabelPadding};

#[derive(Parser, Debug)]
#[command(about = "Handwritten sentence recognition with a CRNN and CTC loss")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a label file, train and export a model
    Train(TrainArgs),
    /// Transcribe one image with a trained model
    Predict {
        #[arg(long)]
        model_dir: PathBuf,
        #[arg(long)]
        image: PathBuf,
    },
    /// Report CER/WER of a trained model over a manifest (val.csv by default)
    Evaluate {
        #[arg(long)]
        model_dir: PathBuf,
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Fail when the average CER exceeds this
        #[arg(long)]
        max_cer: Option<f64>,
        /// Fail when the average WER exceeds this
        #[arg(long)]
        max_wer: Option<f64>,
    },
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// `filename,transcription` lines after a header line
    #[arg(long, default_value = "Datasets/IAM_Sentences/ascii/output.txt")]
    labels: PathBuf,

    #[arg(long, default_value = "Datasets/IAM_Sentences/sentence")]
    images: PathBuf,

    #[arg(long)]
    model_dir: Option<PathBuf>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    width: Option<u32>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Train(args) => train(args),
        Command::Predict { model_dir, image } => predict(&model_dir, &image),
        Command::Evaluate {
            model_dir,
            manifest,
            max_cer,
            max_wer,
        } => evaluate(&model_dir, manifest, max_cer, max_wer),
    }
}

fn train(args: TrainArgs) -> Result<()> {
    let scan = scan_label_file(&args.labels, &args.images)?;

    let mut configs = ModelConfigs::default();
    if let Some(model_dir) = args.model_dir {
        configs.model_path = model_dir;
    }
    configs.train_epochs = args.epochs.unwrap_or(configs.train_epochs);
    configs.batch_size = args.batch_size.unwrap_or(configs.batch_size);
    configs.learning_rate = args.learning_rate.unwrap_or(configs.learning_rate);
    configs.train_workers = args.workers.unwrap_or(configs.train_workers);
    configs.height = args.height.unwrap_or(configs.height);
    configs.width = args.width.unwrap_or(configs.width);
    configs.vocab = scan.vocab_string();
    configs.max_text_length = scan.max_len;
    configs.save()?;

    if scan.samples.is_empty() {
        anyhow::bail!("No usable samples in {:?}", args.labels);
    }
    anyhow::ensure!(
        configs.height >= 8 && configs.width >= 4,
        "Input size {}x{} is too small for the network",
        configs.width,
        configs.height
    );

    let transformers = Transformers {
        resizer: ImageResizer::new(configs.width, configs.height, true),
        indexer: LabelIndexer::new(&configs.vocab),
        padding: LabelPadding::new(configs.max_text_length, configs.blank_index()),
    };
    let provider = DataProvider::new(scan.samples, configs.batch_size, true, transformers);

    let (mut train_provider, val_provider) = provider.split(0.9);
    anyhow::ensure!(
        !train_provider.is_empty() && !val_provider.is_empty(),
        "Need at least one training and one validation sample, got {} and {}",
        train_provider.dataset().len(),
        val_provider.dataset().len()
    );
    let augmentors: Vec<Arc<dyn Augmentor>> = vec![
        Arc::new(RandomBrightness::default()),
        Arc::new(RandomErodeDilate::default()),
        Arc::new(RandomSharpen::default()),
    ];
    train_provider.set_augmentors(augmentors);

    let device = select_device();
    tracing::info!("training on {:?}", device);
    let mut trainer = Trainer::new(&configs, device)?;
    tracing::info!("model has {} trainable parameters", trainer.parameter_count());

    let model_path = configs.model_path.clone();
    let mut callbacks: Vec<Box<dyn Callback>> = vec![
        Box::new(EarlyStopping::new(Monitor::ValCer, 20)),
        Box::new(ModelCheckpoint::new(
            model_path.join(CHECKPOINT_FILE_NAME),
            Monitor::ValCer,
        )),
        Box::new(TrainLogger::new(&model_path)),
        Box::new(MetricsLog::new(&model_path.join("logs"))),
        Box::new(CurvePlot::new(model_path.join("training_curves.png"))),
        Box::new(ReduceLROnPlateau::new(Monitor::ValCer, 0.9, 5, 1e-10)),
        Box::new(ModelExport::new(
            model_path.join(CHECKPOINT_FILE_NAME),
            model_path.join(EXPORT_FILE_NAME),
        )),
    ];

    let history = trainer.fit(
        &train_provider,
        &val_provider,
        configs.train_epochs,
        &mut callbacks,
    )?;
    if let Some(last) = history.last() {
        tracing::info!(
            "finished after {} epochs, val_CER={:.4} val_WER={:.4}",
            last.epoch,
            last.val_cer,
            last.val_wer
        );
    }

    train_provider.to_csv(&model_path.join("train.csv"))?;
    val_provider.to_csv(&model_path.join("val.csv"))?;

    let final_path = model_path.join(FINAL_FILE_NAME);
    trainer
        .varmap()
        .save(&final_path)
        .with_context(|| format!("Failed to save final weights at {:?}", final_path))?;
    tracing::info!("saved final weights to {:?}", final_path);

    Ok(())
}

fn predict(model_dir: &Path, image_path: &Path) -> Result<()> {
    let recognizer = SentenceRecognizer::from_dir(model_dir, select_device())?;
    let image = image::open(image_path)
        .with_context(|| format!("Failed to open image {:?}", image_path))?;

    let text = recognizer.predict(&image)?;
    println!("{text}");
    Ok(())
}

fn evaluate(
    model_dir: &Path,
    manifest: Option<PathBuf>,
    max_cer: Option<f64>,
    max_wer: Option<f64>,
) -> Result<()> {
    let recognizer = SentenceRecognizer::from_dir(model_dir, select_device())?;
    let manifest = manifest.unwrap_or_else(|| model_dir.join("val.csv"));
    let samples = read_manifest_csv(&manifest)?;

    let mut accuracy = BatchAccuracy::new();
    for sample in &samples {
        let image = match image::open(&sample.path) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!("Skipping {:?}: {e}", sample.path);
                continue;
            }
        };
        let predicted = recognizer.predict(&image)?;
        let metrics = accuracy.push(&sample.label, &predicted);
        tracing::debug!(
            "{:?}: {:?} -> {:?} (CER {:.4})",
            sample.path,
            sample.label,
            predicted,
            metrics.cer
        );
    }

    println!("Samples: {}", accuracy.count());
    println!(
        "CER: average {:.4}, max {:.4}",
        accuracy.average_cer(),
        accuracy.max_cer()
    );
    println!(
        "WER: average {:.4}, max {:.4}",
        accuracy.average_wer(),
        accuracy.max_wer()
    );

    let (max_cer, max_wer) = (max_cer.unwrap_or(f64::INFINITY), max_wer.unwrap_or(f64::INFINITY));
    anyhow::ensure!(
        accuracy.meets_thresholds(max_cer, max_wer),
        "Accuracy below thresholds: CER {:.4} > {max_cer} or WER {:.4} > {max_wer}",
        accuracy.average_cer(),
        accuracy.average_wer()
    );
    Ok(())
}
