//! Pixel-level primitives for the recognition pipelines: frame decode and
//! encode, model-input preprocessing, landmark-based warps, sharpness
//! measurement, and on-screen-display drawing.

pub mod draw;
pub mod frame;
pub mod sharpness;
pub mod tensor;
pub mod warp;

pub use frame::Frame;
pub use tensor::{Letterbox, Normalization};
pub use warp::Similarity;
