use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gif::{Encoder, Frame, Repeat};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::{nn, Device, Kind, Tensor};
use tqdm::tqdm;
use tracing_subscriber::EnvFilter;

use magmap_gan::{
    AutoProvider, DataConfig, DataError, Discriminator, DiscriminatorConfig, MagMapDataModule,
    Split,
};

#[derive(Parser, Debug)]
#[command(version, about = "Satellite/map GAN data pipeline and discriminator.", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Set up the data module and print the resolved splits and pipelines
    Splits {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Iterate one split and report batch and sample failures
    Scan {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long, value_enum, default_value_t = SplitArg::Train)]
        split: SplitArg,
        #[arg(short, long, default_value_t = 1)]
        epochs: u64,
    },
    /// Render augmented accesses of one training pair into a GIF
    Preview {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long, default_value_t = 0)]
        index: usize,
        #[arg(short, long, default_value_t = 16)]
        frames: usize,
        #[arg(short, long, default_value = "results/preview.gif")]
        output: PathBuf,
    },
    /// Build the discriminator and run a dummy forward pass
    Discriminator {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 3)]
        channels: i64,
        #[arg(long, default_value_t = 64)]
        num_features: i64,
        #[arg(long, default_value_t = 4)]
        depth: i64,
        #[arg(long, default_value_t = 256)]
        size: i64,
        #[arg(long, default_value_t = 1)]
        batch_size: i64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SplitArg {
    Train,
    Val,
    Test,
}

impl From<SplitArg> for Split {
    fn from(s: SplitArg) -> Split {
        match s {
            SplitArg::Train => Split::Train,
            SplitArg::Val => Split::Val,
            SplitArg::Test => Split::Test,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    match args.command {
        Command::Splits { config } => splits(&config),
        Command::Scan {
            config,
            split,
            epochs,
        } => scan(&config, split.into(), epochs),
        Command::Preview {
            config,
            index,
            frames,
            output,
        } => preview(&config, index, frames, &output),
        Command::Discriminator {
            config,
            channels,
            num_features,
            depth,
            size,
            batch_size,
        } => {
            let cfg = match config {
                Some(path) => DiscriminatorConfig::from_json_file(&path)?,
                None => DiscriminatorConfig {
                    channels,
                    num_features,
                    depth,
                },
            };
            discriminator(&cfg, size, batch_size)
        }
    }
}

fn data_module(config: &Path) -> Result<MagMapDataModule> {
    let cfg = DataConfig::from_json_file(config)?;
    println!("Data Link: {}", cfg.data_link);
    println!("Data Files: {:?}", cfg.data_files);
    println!("Data Dir: {}", cfg.data_dir.display());
    println!("Batch Size: {}", cfg.batch_size);
    println!("Workers: {}", cfg.num_workers);
    println!("Prefetch Factor: {}", cfg.prefetch_factor);
    println!("--------");

    let provider = Arc::new(AutoProvider::new(std::env::var("HF_TOKEN").ok()));
    let mut module = MagMapDataModule::new(cfg, provider)?;
    println!("Loading Dataset...");
    module.setup()?;
    println!("Seed: {}", module.seed());
    println!("--------");
    Ok(module)
}

fn splits(config: &Path) -> Result<()> {
    let module = data_module(config)?;
    let ranges = module.ranges()?;
    println!("Records: {}", module.corpus()?.len());
    for (split, range) in [
        (Split::Train, &ranges.train),
        (Split::Val, &ranges.val),
        (Split::Test, &ranges.test),
    ] {
        let dataset = module.dataset(split)?;
        println!("{split}: [{}, {}) = {} records", range.start, range.end, range.len());
        println!("  pairs: {}", dataset.transform().describe());
        match dataset.color() {
            Some(color) => println!("  satellite: {}", color.describe()),
            None => println!("  satellite: none"),
        }
    }
    Ok(())
}

fn scan(config: &Path, split: Split, epochs: u64) -> Result<()> {
    let module = data_module(config)?;
    let loader = module.loader(split)?;
    println!("Scanning {split}: {} records in {} batches", loader.dataset().len(), loader.len());

    for epoch in 0..epochs {
        let mut samples = 0usize;
        let mut failed_samples = 0usize;
        let mut failed_batches = 0usize;
        for batch in tqdm(loader.iter()) {
            match batch {
                Ok(batch) => {
                    samples += batch.len();
                    failed_samples += batch.failures.len();
                    for failure in &batch.failures {
                        if let DataError::Sample { index, .. } = failure {
                            println!("sample {index} failed: {failure}");
                        }
                    }
                }
                Err(e) => {
                    failed_batches += 1;
                    println!("{e}");
                }
            }
        }
        println!(
            "Epoch {}: samples={} failed_samples={} failed_batches={}",
            epoch + 1,
            samples,
            failed_samples,
            failed_batches
        );
    }
    Ok(())
}

/// [-1, 1] CHW tensor to uint8.
fn denormalize(xs: &Tensor) -> Tensor {
    ((xs * 0.5 + 0.5) * 255.0).clamp(0.0, 255.0).to_kind(Kind::Uint8)
}

fn preview(config: &Path, index: usize, frames: usize, output: &Path) -> Result<()> {
    let module = data_module(config)?;
    let dataset = module.dataset(Split::Train)?;
    if index >= dataset.len() {
        bail!("index {} is outside the train split of {} records", index, dataset.len());
    }

    let size = module.config().train_transforms.size;
    let (width, height) = (2 * size, size);
    if width > u16::MAX as i64 {
        bail!("preview of size {} does not fit in a GIF frame", size);
    }
    if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let mut image = File::create(output)?;
    let mut encoder = Encoder::new(&mut image, width as u16, height as u16, &[])?;
    encoder.set_repeat(Repeat::Infinite)?;

    for i in 0..frames {
        let mut rng = StdRng::seed_from_u64(module.seed().wrapping_add(i as u64));
        let (sat, map) = dataset.get(index, &mut rng)?;
        let (h, w) = (sat.size()[1], sat.size()[2]);
        if (h, w) != (height, height) {
            bail!("sample {} resized to {}x{}, expected a square {}", index, w, h, size);
        }
        // satellite | map
        let frame = Tensor::cat(&[denormalize(&sat), denormalize(&map)], 2)
            .permute([1, 2, 0])
            .contiguous();
        let len = (3 * width * height) as usize;
        let mut data = vec![0u8; len];
        frame.copy_data(&mut data, len);
        let frame = Frame::from_rgb(width as u16, height as u16, &data);
        encoder.write_frame(&frame)?;
    }
    println!("Generated {}", output.display());
    Ok(())
}

fn discriminator(cfg: &DiscriminatorConfig, size: i64, batch_size: i64) -> Result<()> {
    let device = Device::cuda_if_available();
    println!("Use Device: {device:?}");
    println!("Channels: {}", cfg.channels);
    println!("Num Features: {}", cfg.num_features);
    println!("Depth: {}", cfg.depth);
    println!("--------");

    let vs = nn::VarStore::new(device);
    let disc = Discriminator::from_config(vs.root(), cfg)?;
    disc.spec().check_input(size)?;
    for (i, layer) in disc.layers().iter().enumerate() {
        println!("{i:>2}: {layer}");
    }
    let params: i64 = vs.trainable_variables().iter().map(|t| t.numel() as i64).sum();
    println!("Parameters: {params}");

    let shape = [batch_size, cfg.channels, size, size];
    let xs = Tensor::rand(shape, (Kind::Float, device)) * 2.0 - 1.0;
    let ys = tch::no_grad(|| xs.apply_t(&disc, false));
    println!("Input: {:?}", xs.size());
    println!("Realism Map: {:?}", ys.size());
    println!(
        "Range: [{:.4}, {:.4}]",
        ys.min().double_value(&[]),
        ys.max().double_value(&[])
    );
    Ok(())
}
