//! End-to-end playback through the FM backend with a scripted chip port.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use hf_driver::{
    probe_music, FmConfig, MidiOut, MusicBackend, MusicSelect, SongTransport,
};
use hf_driver::FmBackend;
use hf_opl::{PortIo, SynthOptions};

/// Port double that passes the OPL3 detection probe and records all
/// register traffic.
struct FakeChip {
    reads: VecDeque<u8>,
    writes: Arc<Mutex<Vec<(u16, u8)>>>,
}

impl FakeChip {
    fn opl3(writes: Arc<Mutex<Vec<(u16, u8)>>>) -> Self {
        Self {
            reads: VecDeque::from(vec![0x00, 0xc0]),
            writes,
        }
    }

    fn missing() -> Self {
        Self {
            reads: VecDeque::new(),
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl PortIo for FakeChip {
    fn write(&mut self, port: u16, value: u8) {
        if let Ok(mut writes) = self.writes.lock() {
            writes.push((port, value));
        }
    }

    fn read(&mut self, _port: u16) -> u8 {
        self.reads.pop_front().unwrap_or(0xff)
    }

    fn delay_micros(&mut self, _micros: u64) {}
}

#[derive(Default)]
struct NullMidiOut;

impl MidiOut for NullMidiOut {
    fn write(&mut self, _data: &[u8]) {}
}

fn bank_lump() -> Vec<u8> {
    let mut lump = b"#OPL_II#".to_vec();
    lump.extend_from_slice(&vec![0u8; 175 * 36]);
    lump
}

fn song_with_notes() -> Vec<u8> {
    let mut data = b"MThd".to_vec();
    data.extend_from_slice(&6u32.to_be_bytes());
    data.extend_from_slice(&0u16.to_be_bytes());
    data.extend_from_slice(&1u16.to_be_bytes());
    data.extend_from_slice(&48u16.to_be_bytes());
    let body: &[u8] = &[
        0x00, 0x90, 60, 100, // note on at tick 0
        0x30, 0x80, 60, 0, // note off at tick 48
        0x00, 0xff, 0x2f, 0x00,
    ];
    data.extend_from_slice(b"MTrk");
    data.extend_from_slice(&(body.len() as u32).to_be_bytes());
    data.extend_from_slice(body);
    data
}

#[test]
fn fm_backend_plays_a_song_end_to_end() {
    let writes = Arc::new(Mutex::new(Vec::new()));
    let mut backend = FmBackend::new(
        FakeChip::opl3(writes.clone()),
        0x388,
        &bank_lump(),
        SynthOptions::default(),
    )
    .unwrap();
    assert_eq!(backend.synth().total_voices(), 18);

    backend.set_volume(15);
    backend.register(&song_with_notes()).unwrap();
    backend.play(false);
    assert!(backend.is_playing());

    writes.lock().unwrap().clear();
    backend.update(1_000); // clock baseline
    backend.update(50_000); // past the first tick: note on fires

    assert_eq!(backend.synth().allocated_len(), 1);
    assert!(!writes.lock().unwrap().is_empty(), "note-on programs the chip");

    backend.update(2_000_000); // plays out the rest
    assert_eq!(backend.synth().allocated_len(), 0);
    assert!(!backend.is_playing());
}

#[test]
fn stopping_mid_song_silences_all_voices() {
    let writes = Arc::new(Mutex::new(Vec::new()));
    let mut backend = FmBackend::new(
        FakeChip::opl3(writes),
        0x388,
        &bank_lump(),
        SynthOptions::default(),
    )
    .unwrap();

    backend.set_volume(15);
    backend.register(&song_with_notes()).unwrap();
    backend.play(false);
    backend.update(1_000);
    backend.update(20_000);
    assert_eq!(backend.synth().allocated_len(), 1);

    backend.stop();
    assert_eq!(backend.synth().allocated_len(), 0, "all-notes-off burst");
    assert!(!backend.is_playing());
}

#[test]
fn probe_prefers_fm_and_falls_back_to_midi_port() {
    let writes = Arc::new(Mutex::new(Vec::new()));
    let mut driver = probe_music(
        MusicSelect::Auto,
        Some(FmConfig {
            port: FakeChip::opl3(writes),
            base: 0x388,
            bank_lump: bank_lump(),
            options: SynthOptions::default(),
        }),
        Some(NullMidiOut),
    );
    assert!(driver.is_enabled());
    assert!(driver.register_song(&song_with_notes()).is_some());

    // A dead chip falls through to the MIDI port backend.
    let driver = probe_music(
        MusicSelect::Auto,
        Some(FmConfig {
            port: FakeChip::missing(),
            base: 0x388,
            bank_lump: bank_lump(),
            options: SynthOptions::default(),
        }),
        Some(NullMidiOut),
    );
    assert!(driver.is_enabled());

    // With nothing available the driver is disabled, not an error.
    let mut driver = probe_music::<FakeChip, NullMidiOut>(
        MusicSelect::Auto,
        Some(FmConfig {
            port: FakeChip::missing(),
            base: 0x388,
            bank_lump: bank_lump(),
            options: SynthOptions::default(),
        }),
        None,
    );
    assert!(!driver.is_enabled());
    assert_eq!(driver.register_song(&song_with_notes()), None);
}

#[test]
fn transport_survives_a_backendless_update_cycle() {
    // Regression guard: a transport with no song registered must accept
    // every operation quietly.
    let mut transport = SongTransport::new();
    let mut sink = hf_midi::NullHandler;
    transport.play(false, &mut sink);
    transport.update(10_000, &mut sink);
    transport.stop(&mut sink);
    assert!(!transport.is_playing());
}
