use std::error::Error;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::info;

use stablediffusion::checkpoint::Checkpoint;

/// Re-encode a PyTorch checkpoint as safetensors, keeping its global step.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Source checkpoint (.ckpt, .pt, .pth or .safetensors)
    input: PathBuf,

    /// Destination .safetensors file
    output: PathBuf,
}

fn convert(args: &Args) -> Result<(), Box<dyn Error>> {
    info!("Loading checkpoint...");
    let checkpoint = Checkpoint::load(&args.input)?;
    if let Some(step) = checkpoint.global_step {
        info!("Global Step: {}", step);
    }

    info!("Saving {} tensors...", checkpoint.state_dict.len());
    checkpoint.save_safetensors(&args.output)?;

    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = convert(&args) {
        eprintln!("Failed to convert {}: {}", args.input.display(), e);
        process::exit(1);
    }

    println!(
        "Successfully converted {} to {}",
        args.input.display(),
        args.output.display()
    );
}
