//! Raw MIDI passthrough backend.
//!
//! Streams sequencer events byte-for-byte to an external MIDI port,
//! scaling note velocities by the music volume on the way out.

use hf_midi::{MidiEvent, MidiHandler, SysexEvent};

use crate::music::MusicBackend;
use crate::transport::{RegisterError, SongTransport};

/// External MIDI output collaborator.
pub trait MidiOut {
    fn write(&mut self, data: &[u8]);
}

/// Handler applying the legacy volume scale before forwarding.
struct ScaledOut<'a, M: MidiOut> {
    out: &'a mut M,
    volume: u32,
}

impl<M: MidiOut> MidiHandler for ScaledOut<'_, M> {
    fn midi(&mut self, event: &MidiEvent) {
        let mut data = event.data;
        // The mask test matches more statuses than note-on, note-off and
        // aftertouch included. That is how the original scales, so any
        // "fixed" comparison here would change audible behavior.
        if data[0] & 0x90 != 0 {
            let velocity = (self.volume * u32::from(data[2])) / 15;
            data[2] = velocity.min(127) as u8;
        }
        self.out.write(&data[..usize::from(event.size).min(4)]);
    }

    fn sysex(&mut self, event: &SysexEvent) {
        self.out.write(event.bytes());
    }
}

/// Music backend forwarding events to external MIDI hardware.
pub struct PortBackend<M: MidiOut> {
    out: M,
    transport: SongTransport,
    volume: u32,
}

impl<M: MidiOut> PortBackend<M> {
    pub fn new(out: M) -> Self {
        Self {
            out,
            transport: SongTransport::new(),
            volume: 0,
        }
    }
}

impl<M: MidiOut> MusicBackend for PortBackend<M> {
    fn update(&mut self, elapsed_micros: u32) {
        let volume = self.volume;
        let mut handler = ScaledOut { out: &mut self.out, volume };
        self.transport.update(elapsed_micros, &mut handler);
    }

    fn set_volume(&mut self, volume: u32) {
        self.volume = volume;
    }

    fn register(&mut self, data: &[u8]) -> Result<(), RegisterError> {
        self.transport.register(data)
    }

    fn unregister(&mut self) {
        self.transport.unregister();
    }

    fn play(&mut self, looping: bool) {
        let volume = self.volume;
        let mut handler = ScaledOut { out: &mut self.out, volume };
        self.transport.play(looping, &mut handler);
    }

    fn stop(&mut self) {
        let volume = self.volume;
        let mut handler = ScaledOut { out: &mut self.out, volume };
        self.transport.stop(&mut handler);
    }

    fn pause(&mut self) {
        let volume = self.volume;
        let mut handler = ScaledOut { out: &mut self.out, volume };
        self.transport.pause(&mut handler);
    }

    fn resume(&mut self) {
        let volume = self.volume;
        let mut handler = ScaledOut { out: &mut self.out, volume };
        self.transport.resume(&mut handler);
    }

    fn is_playing(&self) -> bool {
        self.transport.is_playing()
    }

    fn shutdown(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        messages: Vec<Vec<u8>>,
    }

    impl MidiOut for Recorder {
        fn write(&mut self, data: &[u8]) {
            self.messages.push(data.to_vec());
        }
    }

    fn note_on(key: u8, velocity: u8) -> MidiEvent {
        MidiEvent {
            track: 0,
            channel: 0,
            size: 3,
            data: [0x90, key, velocity, 0],
        }
    }

    #[test]
    fn full_volume_passes_velocity_through() {
        let mut out = Recorder::default();
        let mut handler = ScaledOut { out: &mut out, volume: 15 };
        handler.midi(&note_on(60, 100));
        assert_eq!(out.messages, vec![vec![0x90, 60, 100]]);
    }

    #[test]
    fn reduced_volume_scales_velocity_down() {
        let mut out = Recorder::default();
        let mut handler = ScaledOut { out: &mut out, volume: 7 };
        handler.midi(&note_on(60, 100));
        assert_eq!(out.messages[0][2], (7u32 * 100 / 15) as u8);
    }

    #[test]
    fn scaled_velocity_clamps_at_127() {
        let mut out = Recorder::default();
        let mut handler = ScaledOut { out: &mut out, volume: 30 };
        handler.midi(&note_on(60, 100));
        assert_eq!(out.messages[0][2], 127);
    }

    #[test]
    fn controller_data_is_scaled_by_the_mask_quirk() {
        // 0xb0 & 0x90 is nonzero, so controller values get the same
        // treatment as velocities.
        let mut out = Recorder::default();
        let mut handler = ScaledOut { out: &mut out, volume: 7 };
        handler.midi(&MidiEvent {
            track: 0,
            channel: 0,
            size: 3,
            data: [0xb0, 0x07, 90, 0],
        });
        assert_eq!(out.messages[0][2], (7u32 * 90 / 15) as u8);
    }

    #[test]
    fn program_change_forwards_two_bytes() {
        let mut out = Recorder::default();
        let mut handler = ScaledOut { out: &mut out, volume: 15 };
        handler.midi(&MidiEvent {
            track: 0,
            channel: 2,
            size: 2,
            data: [0xc2, 0x13, 0, 0],
        });
        assert_eq!(out.messages, vec![vec![0xc2, 0x13]]);
    }
}
