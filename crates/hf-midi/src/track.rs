//! Per-track cursor state.

use crate::event::MidiEvent;

/// Cursor and timing state for one track chunk.
#[derive(Clone, Debug, Default)]
pub(crate) struct Track {
    /// Track index within the file.
    pub id: u8,
    /// Length of the track chunk in bytes.
    pub length: u32,
    /// Offset of the chunk body from the start of the file.
    pub start_offset: u32,
    /// Read offset from the start of the chunk body.
    pub offset: u32,
    /// Ticks accumulated since the last dispatched event.
    pub elapsed_ticks: u32,
    /// Set by an end-of-track meta event, by running off the end of the
    /// chunk, or by an unrecognized status byte.
    pub end_of_track: bool,
    /// Last channel message, kept for running status.
    pub event: MidiEvent,
}

impl Track {
    /// Rewind to the start of the chunk. Cleared only by an explicit restart.
    pub fn restart(&mut self) {
        self.offset = 0;
        self.elapsed_ticks = 0;
        self.end_of_track = false;
    }
}
