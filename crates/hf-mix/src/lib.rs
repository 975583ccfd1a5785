//! Sound effect mixer: a fixed bank of sample channels resampled with
//! Q16.16 fixed-point steps and additively mixed into a stereo buffer
//! under the audio callback's deadline.

mod mixer;
mod sample;
mod volume;

pub use mixer::{Mixer, SfxId, NUM_CHANNELS};
pub use sample::{SoundData, NATIVE_RATE};
pub use volume::stereo_gains;
