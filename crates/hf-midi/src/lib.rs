//! Standard MIDI File sequencer.
//!
//! Parses an SMF byte stream and advances musical time against a caller
//! supplied microsecond clock, dispatching channel, sysex and meta events
//! to a pluggable [`MidiHandler`].

mod event;
mod file;
mod track;

pub use event::{
    controller, status, MetaEvent, MidiEvent, MidiHandler, NullHandler, SysexEvent,
    EVENT_BUF_LEN,
};
pub use file::{MidiFile, ParseError, MAX_TRACKS};
