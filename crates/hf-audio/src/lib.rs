//! Audio output backends and post-mix format conversion.

mod convert;
mod cpal_backend;
mod frame;
mod traits;

pub use convert::LinearResampler;
pub use cpal_backend::CpalOutput;
pub use frame::Frame;
pub use traits::{AudioError, AudioOutput};
