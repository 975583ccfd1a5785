//! Song transport shared by every music backend: registration, playback
//! flags and the microsecond clock driving the sequencer.

use hf_midi::{MidiFile, MidiHandler, ParseError};
use thiserror::Error;

/// Upper bound on an accepted MIDI payload.
pub const MAX_MIDI_LEN: usize = 96 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("song data too large ({0} bytes)")]
    TooLarge(usize),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// One registered song and its playback state.
#[derive(Default)]
pub struct SongTransport {
    midi: Option<MidiFile>,
    playing: bool,
    paused: bool,
    looping: bool,
    micros: u32,
}

impl SongTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and adopt a song, replacing any registered one. On failure no
    /// song remains registered.
    pub fn register(&mut self, data: &[u8]) -> Result<(), RegisterError> {
        self.unregister();
        if data.len() >= MAX_MIDI_LEN {
            return Err(RegisterError::TooLarge(data.len()));
        }
        self.midi = Some(MidiFile::open(data.to_vec())?);
        Ok(())
    }

    pub fn unregister(&mut self) {
        self.paused = true;
        self.playing = false;
        self.midi = None;
    }

    pub fn is_registered(&self) -> bool {
        self.midi.is_some()
    }

    /// Start the registered song from the top.
    pub fn play<H: MidiHandler>(&mut self, looping: bool, handler: &mut H) {
        self.stop(handler);
        let Some(midi) = self.midi.as_mut() else {
            return;
        };
        midi.restart(handler);
        midi.set_looping(looping);
        self.micros = 0;
        self.looping = looping;
        self.paused = false;
        self.playing = true;
    }

    /// Stop playback, silencing all channels through the handler.
    pub fn stop<H: MidiHandler>(&mut self, handler: &mut H) {
        let Some(midi) = self.midi.as_mut() else {
            return;
        };
        self.paused = true;
        self.playing = false;
        midi.pause(true, handler);
    }

    pub fn pause<H: MidiHandler>(&mut self, handler: &mut H) {
        let Some(midi) = self.midi.as_mut() else {
            return;
        };
        self.paused = true;
        midi.pause(true, handler);
    }

    pub fn resume<H: MidiHandler>(&mut self, handler: &mut H) {
        let Some(midi) = self.midi.as_mut() else {
            return;
        };
        midi.pause(false, handler);
        self.paused = false;
    }

    /// Advance the song by the elapsed wall-clock time.
    pub fn update<H: MidiHandler>(&mut self, elapsed_micros: u32, handler: &mut H) {
        if !self.playing || self.paused {
            return;
        }
        let Some(midi) = self.midi.as_mut() else {
            return;
        };
        self.micros = self.micros.wrapping_add(elapsed_micros);
        midi.update(self.micros, handler);
        if midi.is_finished(handler) {
            if self.looping {
                midi.restart(handler);
            } else {
                self.playing = false;
            }
        }
    }

    pub fn is_playing(&self) -> bool {
        self.midi.is_some() && self.playing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hf_midi::{MidiEvent, NullHandler};

    struct Counter {
        notes: usize,
    }

    impl MidiHandler for Counter {
        fn midi(&mut self, event: &MidiEvent) {
            if event.data[0] & 0xf0 == 0x90 {
                self.notes += 1;
            }
        }
    }

    fn demo_song() -> Vec<u8> {
        let mut data = b"MThd".to_vec();
        data.extend_from_slice(&6u32.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&48u16.to_be_bytes());
        let body: &[u8] = &[
            0x30, 0x90, 60, 100, // tick 48: note on
            0x00, 0xff, 0x2f, 0x00,
        ];
        data.extend_from_slice(b"MTrk");
        data.extend_from_slice(&(body.len() as u32).to_be_bytes());
        data.extend_from_slice(body);
        data
    }

    #[test]
    fn register_rejects_oversized_payload() {
        let mut transport = SongTransport::new();
        let err = transport.register(&vec![0u8; MAX_MIDI_LEN]).unwrap_err();
        assert_eq!(err, RegisterError::TooLarge(MAX_MIDI_LEN));
        assert!(!transport.is_registered());
    }

    #[test]
    fn register_rejects_non_midi_bytes() {
        let mut transport = SongTransport::new();
        assert!(transport.register(b"RIFFxxxx").is_err());
        assert!(!transport.is_registered());
    }

    #[test]
    fn failed_register_drops_previous_song() {
        let mut transport = SongTransport::new();
        transport.register(&demo_song()).unwrap();
        assert!(transport.register(b"junk").is_err());
        assert!(!transport.is_registered());
    }

    #[test]
    fn update_before_play_does_nothing() {
        let mut transport = SongTransport::new();
        transport.register(&demo_song()).unwrap();
        let mut counter = Counter { notes: 0 };
        transport.update(1_000_000, &mut counter);
        assert_eq!(counter.notes, 0);
        assert!(!transport.is_playing());
    }

    #[test]
    fn playing_dispatches_and_finishes() {
        let mut transport = SongTransport::new();
        transport.register(&demo_song()).unwrap();
        let mut counter = Counter { notes: 0 };

        transport.play(false, &mut counter);
        assert!(transport.is_playing());

        transport.update(1_000, &mut counter); // clock baseline
        transport.update(2_000_000, &mut counter);
        assert_eq!(counter.notes, 1);
        assert!(!transport.is_playing(), "non-looping song ends");
    }

    #[test]
    fn looping_song_keeps_playing() {
        let mut transport = SongTransport::new();
        transport.register(&demo_song()).unwrap();
        let mut counter = Counter { notes: 0 };

        transport.play(true, &mut counter);
        transport.update(1_000, &mut counter);
        for _ in 0..6 {
            transport.update(1_000_000, &mut counter);
        }
        assert!(transport.is_playing());
        assert!(counter.notes > 1, "song restarted at least once");
    }

    #[test]
    fn pause_suppresses_updates_until_resume() {
        let mut transport = SongTransport::new();
        transport.register(&demo_song()).unwrap();
        let mut counter = Counter { notes: 0 };

        transport.play(false, &mut counter);
        transport.update(1_000, &mut counter);
        transport.pause(&mut counter);
        transport.update(2_000_000, &mut counter);
        assert_eq!(counter.notes, 0);

        transport.resume(&mut counter);
        transport.update(2_000_000, &mut counter);
        transport.update(4_000_000, &mut counter);
        assert_eq!(counter.notes, 1);
    }

    #[test]
    fn stop_then_play_restarts_from_the_top() {
        let mut transport = SongTransport::new();
        transport.register(&demo_song()).unwrap();
        let mut handler = NullHandler;

        transport.play(false, &mut handler);
        transport.stop(&mut handler);
        assert!(!transport.is_playing());

        let mut counter = Counter { notes: 0 };
        transport.play(false, &mut counter);
        transport.update(1_000, &mut counter);
        transport.update(2_000_000, &mut counter);
        assert_eq!(counter.notes, 1);
    }
}
