//! FM synthesis driver: timed register I/O, the General-MIDI-over-FM
//! instrument bank, and the voice allocator that maps MIDI channel events
//! onto a fixed pool of OPL2/OPL3 hardware voices.

mod instrument;
mod io;
mod synth;
mod tables;

pub use instrument::{
    BankError, Instrument, InstrumentBank, InstrumentId, OperatorPatch, VoicePatch,
    FLAG_DOUBLE_VOICE, FLAG_FIXED_PITCH, NUM_MELODIC, NUM_PERCUSSION,
    PERCUSSION_FIRST_KEY, PERCUSSION_LAST_KEY,
};
pub use io::{reg, ChipType, InitError, Opl, PortIo, NUM_OPERATORS, VOICES_PER_ARRAY};
pub use synth::{DriverVersion, FmSynth, SynthOptions, MAX_VOICES, MIDI_CHANNELS};
