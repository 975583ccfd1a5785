//! Driver layer tying the engine together: the music facade with its
//! pluggable backends, the song transport, the sound-effect API over the
//! mixer, and the render loop feeding the host audio device.

mod engine;
mod fm_backend;
mod midi_backend;
mod music;
mod sound;
mod store;
mod transport;

pub use engine::{AudioCore, EngineState, BLOCK_FRAMES, INTERNAL_RATE};
pub use fm_backend::FmBackend;
pub use midi_backend::{MidiOut, PortBackend};
pub use music::{probe_music, FmConfig, MusicBackend, MusicDriver, MusicSelect, SongHandle};
pub use sound::SfxPlayer;
pub use store::{ContentStore, MemoryStore};
pub use transport::{RegisterError, SongTransport, MAX_MIDI_LEN};
