//! Event types delivered by the sequencer.

/// Capacity of the sysex/meta payload buffers.
pub const EVENT_BUF_LEN: usize = 256;

/// MIDI channel message status nibbles (high 4 bits of the status byte).
pub mod status {
    pub const NOTE_OFF: u8 = 0x80;
    pub const NOTE_ON: u8 = 0x90;
    pub const AFTERTOUCH: u8 = 0xA0;
    pub const CONTROLLER: u8 = 0xB0;
    pub const PROGRAM_CHANGE: u8 = 0xC0;
    pub const CHANNEL_AFTERTOUCH: u8 = 0xD0;
    pub const PITCH_BEND: u8 = 0xE0;
}

/// MIDI controller numbers the engine cares about.
pub mod controller {
    pub const VOLUME_MSB: u8 = 0x07;
    pub const PAN: u8 = 0x0A;
    pub const ALL_NOTES_OFF: u8 = 0x7B;
}

/// A channel message.
///
/// One of these persists per track so that running status can reuse the
/// previous message's status byte, channel and size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MidiEvent {
    /// Track the event was read from.
    pub track: u8,
    /// MIDI channel (0-15).
    pub channel: u8,
    /// Number of valid bytes in `data`.
    pub size: u8,
    /// Status byte followed by the data bytes.
    pub data: [u8; 4],
}

/// A system-exclusive message, boundaries included.
#[derive(Clone, Copy, Debug)]
pub struct SysexEvent {
    /// Track the event was read from.
    pub track: u8,
    /// Number of valid bytes in `data`.
    pub size: u16,
    pub data: [u8; EVENT_BUF_LEN],
}

impl SysexEvent {
    pub(crate) fn new(track: u8) -> Self {
        Self { track, size: 0, data: [0; EVENT_BUF_LEN] }
    }

    /// The valid payload bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..usize::from(self.size).min(EVENT_BUF_LEN)]
    }
}

/// A meta event. The payload copy is capped at the buffer capacity; the
/// stream is always advanced past the full encoded length.
#[derive(Clone, Copy, Debug)]
pub struct MetaEvent {
    /// Track the event was read from.
    pub track: u8,
    /// Meta event type byte.
    pub kind: u8,
    /// Encoded payload length (may exceed what `data` holds).
    pub size: u16,
    pub data: [u8; EVENT_BUF_LEN],
}

impl MetaEvent {
    pub(crate) fn new(track: u8, kind: u8, size: u16) -> Self {
        Self { track, kind, size, data: [0; EVENT_BUF_LEN] }
    }
}

/// Receiver for dispatched events.
///
/// Sysex and meta notifications default to no-ops; most consumers only
/// care about channel messages.
pub trait MidiHandler {
    fn midi(&mut self, event: &MidiEvent);
    fn sysex(&mut self, _event: &SysexEvent) {}
    fn meta(&mut self, _event: &MetaEvent) {}
}

/// Handler that discards every event.
pub struct NullHandler;

impl MidiHandler for NullHandler {
    fn midi(&mut self, _event: &MidiEvent) {}
}

impl<T: MidiHandler + ?Sized> MidiHandler for &mut T {
    fn midi(&mut self, event: &MidiEvent) {
        (**self).midi(event);
    }

    fn sysex(&mut self, event: &SysexEvent) {
        (**self).sysex(event);
    }

    fn meta(&mut self, event: &MetaEvent) {
        (**self).meta(event);
    }
}
