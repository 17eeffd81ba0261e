use std::error::Error;
use std::path::PathBuf;
use std::process;

use burn::tensor::backend::Backend;
use clap::Parser;
use log::info;

use stablediffusion::pipeline::StableDiffusionModel;

cfg_if::cfg_if! {
    if #[cfg(feature = "wgpu-backend")] {
        type SampleBackend = burn_wgpu::Wgpu;

        fn device() -> burn_wgpu::WgpuDevice {
            burn_wgpu::WgpuDevice::default()
        }
    } else if #[cfg(feature = "tch-backend")] {
        type SampleBackend = burn_tch::LibTorch<f32>;

        fn device() -> burn_tch::LibTorchDevice {
            burn_tch::LibTorchDevice::Cuda(0)
        }
    } else {
        type SampleBackend = burn_ndarray::NdArray<f32>;

        fn device() -> burn_ndarray::NdArrayDevice {
            burn_ndarray::NdArrayDevice::Cpu
        }
    }
}

/// Generate images from text prompts with a Stable Diffusion v1 model directory.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Directory holding v1-inference.yml, sd-v1-4.ckpt and bpe_simple_vocab_16e6.txt
    model_dir: PathBuf,

    /// One image is generated per prompt
    #[arg(required = true)]
    prompts: Vec<String>,

    #[arg(long, default_value_t = 512)]
    height: usize,

    #[arg(long, default_value_t = 512)]
    width: usize,

    /// DDIM sampling steps
    #[arg(long, default_value_t = 50)]
    steps: usize,

    /// Image i is written to <OUTPUT><i>.png
    #[arg(short, long, default_value = "sample")]
    output: String,

    #[arg(long)]
    seed: Option<u64>,

    /// Log missing and unexpected checkpoint keys
    #[arg(short, long)]
    verbose: bool,
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let device = device();
    if let Some(seed) = args.seed {
        SampleBackend::seed(seed);
    }

    info!("Loading model...");
    let (sd, report) = StableDiffusionModel::<SampleBackend>::load(&args.model_dir, &device, args.verbose)?;
    info!("Loaded {} tensors", report.matched.len());

    info!("Sampling {} image(s)...", args.prompts.len());
    let images = sd.predict_step(&args.prompts, 0, args.height, args.width, args.steps)?;

    for (index, image) in images.iter().enumerate() {
        let path = format!("{}{}.png", args.output, index);
        image.save(&path)?;
        info!("Saved {}", path);
    }

    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Args::parse()) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
