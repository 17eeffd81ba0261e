pub mod latent_diffusion;

pub mod autoencoder;
pub mod clip;
pub mod unet;

pub mod attention;
pub mod groupnorm;

pub mod load;
