//! Burn networks for volumetric segmentation.
//!
//! - `SegResNet`: residual encoder-decoder with group normalization, after
//!   Myronenko's "3D MRI brain tumor segmentation using autoencoder
//!   regularization" (without the VAE branch).
//!
//! These are pure Burn Modules; losses, sliding-window inference and training
//! loops live in the `training` crate.

mod segresnet;

pub use segresnet::{upsample_trilinear_x2, ResBlock, SegResNet, SegResNetConfig};
