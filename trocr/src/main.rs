use clap::Parser;
use trocr::{DEFAULT_REPO, TrOcr};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    image: String,

    /// Hugging Face repository holding the ONNX encoder/decoder pair
    #[arg(long, default_value = DEFAULT_REPO)]
    repo: String,

    #[arg(long)]
    max_length: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let image =
        image::open(&args.image).map_err(|e| anyhow::anyhow!("Failed to open image: {e}"))?;

    let mut model = TrOcr::new(&args.repo)?;
    if let Some(max_length) = args.max_length {
        model.set_max_length(max_length);
    }

    let pixel_values = model.preprocess(&image);
    let generated_ids = model.generate(pixel_values)?;
    let generated_text = model.decode(&generated_ids)?;

    println!("OCR text: {}", generated_text);
    println!("Token ids: {:?}", generated_ids);

    Ok(())
}
