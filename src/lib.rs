//! Text-to-image inference for Stable Diffusion v1 checkpoints on burn.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod loader;
pub mod model;
pub mod pipeline;
pub mod sampler;
pub mod tokenizer;

pub use error::{Error, Result};
pub use loader::{load_model_from_config, LoadReport};
pub use pipeline::StableDiffusionModel;
