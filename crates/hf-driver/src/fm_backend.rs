//! Music backend driving the FM synthesis voice engine.

use hf_opl::{FmSynth, InitError, PortIo, SynthOptions};

use crate::music::MusicBackend;
use crate::transport::{RegisterError, SongTransport};

/// Plays registered songs by dispatching sequencer events into the FM
/// voice engine.
pub struct FmBackend<P: PortIo> {
    synth: FmSynth<P>,
    transport: SongTransport,
}

impl<P: PortIo> FmBackend<P> {
    /// Probe and initialize the chip, then load the instrument bank.
    pub fn new(port: P, base: u16, bank_lump: &[u8], options: SynthOptions) -> Result<Self, InitError> {
        Ok(Self {
            synth: FmSynth::init(port, base, bank_lump, options)?,
            transport: SongTransport::new(),
        })
    }

    pub fn synth(&self) -> &FmSynth<P> {
        &self.synth
    }
}

impl<P: PortIo> MusicBackend for FmBackend<P> {
    fn update(&mut self, elapsed_micros: u32) {
        self.transport.update(elapsed_micros, &mut self.synth);
    }

    fn set_volume(&mut self, volume: u32) {
        self.synth.set_music_volume(volume);
    }

    fn register(&mut self, data: &[u8]) -> Result<(), RegisterError> {
        self.transport.register(data)
    }

    fn unregister(&mut self) {
        self.transport.unregister();
    }

    fn play(&mut self, looping: bool) {
        self.transport.stop(&mut self.synth);
        self.synth.start_song();
        self.transport.play(looping, &mut self.synth);
    }

    fn stop(&mut self) {
        self.transport.stop(&mut self.synth);
    }

    fn pause(&mut self) {
        self.transport.pause(&mut self.synth);
    }

    fn resume(&mut self) {
        self.transport.resume(&mut self.synth);
    }

    fn is_playing(&self) -> bool {
        self.transport.is_playing()
    }

    fn shutdown(&mut self) {}
}
