//! SMF parsing and playback clock.

use thiserror::Error;

use crate::event::{MetaEvent, MidiEvent, MidiHandler, SysexEvent, EVENT_BUF_LEN};
use crate::track::Track;

/// Maximum number of track chunks in a file.
pub const MAX_TRACKS: usize = 32;

/// Cap on events dispatched per track per tick batch, so corrupt data
/// cannot spin the update loop forever.
const MAX_EVENTS_PER_BATCH: usize = 100;

const HEADER_MAGIC: &[u8; 4] = b"MThd";
const TRACK_MAGIC: &[u8; 4] = b"MTrk";

const META_END_OF_TRACK: u8 = 0x2F;
const META_SET_TEMPO: u8 = 0x51;
const META_TIME_SIGNATURE: u8 = 0x58;

/// Reasons a byte stream is rejected by [`MidiFile::open`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("not a standard MIDI file")]
    BadMagic,
    #[error("unexpected header length {0}")]
    BadHeaderLength(u32),
    #[error("unsupported file format {0}")]
    BadFormat(u16),
    #[error("bad track count {0}")]
    BadTrackCount(u16),
    #[error("unsupported SMPTE frame rate code {0}")]
    BadSmpteRate(u8),
    #[error("track {0} has no chunk marker")]
    BadTrackHeader(usize),
}

/// A parsed Standard MIDI File with its playback clock.
///
/// The file owns its raw bytes; tracks are byte-range windows into them.
/// Time advances from the absolute microsecond values handed to
/// [`update`](MidiFile::update), carrying the division remainder forward so
/// rounding error does not accumulate across calls.
#[derive(Debug)]
pub struct MidiFile {
    data: Vec<u8>,
    pos: usize,

    format: u16,
    tracks: Vec<Track>,

    ticks_per_quarter_note: u16,
    /// Microseconds per tick, recomputed on any tempo/PPQN/signature change.
    tick_time: u32,
    tempo: u16,
    tempo_delta: i16,
    time_signature: [u8; 2],

    last_tick_error: u32,
    last_check_micros: u32,
    now_micros: u32,

    synch_done: bool,
    paused: bool,
    looping: bool,
}

impl MidiFile {
    /// Parse an SMF byte stream. No sequencer state is retained on error.
    pub fn open(data: Vec<u8>) -> Result<Self, ParseError> {
        let mut mf = Self {
            data,
            pos: 0,
            format: 0,
            tracks: Vec::new(),
            ticks_per_quarter_note: 0,
            tick_time: 0,
            tempo: 0,
            tempo_delta: 0,
            time_signature: [0; 2],
            last_tick_error: 0,
            last_check_micros: 0,
            now_micros: 0,
            synch_done: false,
            paused: true,
            looping: false,
        };

        mf.set_ticks_per_quarter_note(48);
        mf.set_tempo(120);
        mf.set_tempo_adjust(0);
        mf.set_micros_per_quarter_note(500_000);
        mf.set_time_signature(4, 4);
        mf.parse_header()?;
        Ok(mf)
    }

    // --- byte cursor -----------------------------------------------------

    // Reads past the end of the buffer yield zero; the per-track length
    // bookkeeping is what actually stops playback.
    fn read_byte(&mut self) -> u8 {
        let b = self.data.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        b
    }

    fn read_multi(&mut self, len: usize) -> u32 {
        let mut value: u32 = 0;
        for _ in 0..len {
            value = (value << 8) + u32::from(self.read_byte());
        }
        value
    }

    fn read_varlen(&mut self) -> u32 {
        let mut value: u32 = 0;
        loop {
            let b = self.read_byte();
            value = (value << 7) + u32::from(b & 0x7f);
            if b & 0x80 == 0 {
                break;
            }
        }
        value
    }

    fn read_into(&mut self, buf: &mut [u8]) {
        for slot in buf {
            *slot = self.read_byte();
        }
    }

    // --- time base -------------------------------------------------------

    fn calc_tick_time(&mut self) {
        // Held at the prior value when tempo, PPQN or the signature
        // denominator would make the division meaningless.
        let beats = i64::from(self.tempo) + i64::from(self.tempo_delta);
        if beats != 0 && self.ticks_per_quarter_note != 0 && self.time_signature[1] != 0 {
            let per_beat = 60_000_000 / beats;
            self.tick_time = (per_beat / i64::from(self.ticks_per_quarter_note)) as u32;
        }
    }

    fn set_micros_per_quarter_note(&mut self, micros: u32) {
        // Value from the set-tempo meta message; stored as beats per minute.
        if micros != 0 {
            self.tempo = (60_000_000 / micros) as u16;
        }
        self.calc_tick_time();
    }

    fn set_tempo(&mut self, tempo: u16) {
        if i32::from(self.tempo_delta) + i32::from(tempo) > 0 {
            self.tempo = tempo;
        }
        self.calc_tick_time();
    }

    /// Offset the file tempo by `delta` beats per minute.
    pub fn set_tempo_adjust(&mut self, delta: i16) {
        if i32::from(delta) + i32::from(self.tempo) > 0 {
            self.tempo_delta = delta;
        }
        self.calc_tick_time();
    }

    fn set_ticks_per_quarter_note(&mut self, ticks: u16) {
        self.ticks_per_quarter_note = ticks;
        self.calc_tick_time();
    }

    fn set_time_signature(&mut self, numerator: u8, denominator: u8) {
        self.time_signature = [numerator, denominator];
        self.calc_tick_time();
    }

    /// Work out how many ticks have elapsed, carrying the remainder
    /// forward so cumulative drift does not compound.
    fn tick_clock(&mut self) -> u32 {
        if self.tick_time == 0 {
            return 0;
        }
        let elapsed = self
            .last_tick_error
            .wrapping_add(self.now_micros.wrapping_sub(self.last_check_micros));
        if elapsed < self.tick_time {
            return 0;
        }
        let ticks = elapsed / self.tick_time;
        self.last_tick_error = elapsed - self.tick_time * ticks;
        self.last_check_micros = self.now_micros;
        ticks
    }

    fn synch_tracks(&mut self) {
        for track in &mut self.tracks {
            track.elapsed_ticks = 0;
        }
        self.last_check_micros = self.now_micros;
        self.last_tick_error = 0;
    }

    // --- header ----------------------------------------------------------

    fn parse_header(&mut self) -> Result<(), ParseError> {
        self.pos = 0;

        let mut magic = [0u8; 4];
        self.read_into(&mut magic);
        if &magic != HEADER_MAGIC {
            return Err(ParseError::BadMagic);
        }

        let header_len = self.read_multi(4);
        if header_len != 6 {
            return Err(ParseError::BadHeaderLength(header_len));
        }

        self.format = self.read_multi(2) as u16;
        if self.format != 0 && self.format != 1 {
            return Err(ParseError::BadFormat(self.format));
        }

        let track_count = self.read_multi(2) as u16;
        if (self.format == 0 && track_count != 1) || usize::from(track_count) > MAX_TRACKS {
            return Err(ParseError::BadTrackCount(track_count));
        }

        let division = self.read_multi(2) as u16;
        if division & 0x8000 != 0 {
            // SMPTE division: normalize to an equivalent PPQN.
            let rate_code = (division >> 8) as u8;
            let resolution = division & 0x00ff;
            let frames_per_second: u16 = match rate_code {
                232 => 24,
                231 => 25,
                227 => 29,
                226 => 30,
                other => return Err(ParseError::BadSmpteRate(other)),
            };
            self.ticks_per_quarter_note = frames_per_second * resolution;
        } else {
            self.ticks_per_quarter_note = division;
        }
        self.calc_tick_time();

        self.tracks.clear();
        for i in 0..usize::from(track_count) {
            let mut magic = [0u8; 4];
            self.read_into(&mut magic);
            if &magic != TRACK_MAGIC {
                self.tracks.clear();
                return Err(ParseError::BadTrackHeader(i));
            }

            let length = self.read_multi(4);
            let mut track = Track {
                id: i as u8,
                length,
                start_offset: self.pos as u32,
                ..Track::default()
            };
            track.event.track = i as u8;
            self.tracks.push(track);

            // Jump to the next chunk header.
            self.pos += length as usize;
        }

        Ok(())
    }

    // --- event dispatch --------------------------------------------------

    fn parse_event<H: MidiHandler>(&mut self, index: usize, handler: &mut H) {
        let etype = self.read_byte();
        match etype {
            // Channel message with two data bytes.
            0x80..=0xbf | 0xe0..=0xef => {
                let d1 = self.read_byte();
                let d2 = self.read_byte();
                let track = &mut self.tracks[index];
                track.event.size = 3;
                track.event.channel = etype & 0x0f;
                track.event.data = [etype, d1, d2, 0];
                let event = track.event;
                handler.midi(&event);
            }

            // Channel message with one data byte.
            0xc0..=0xdf => {
                let d1 = self.read_byte();
                let track = &mut self.tracks[index];
                track.event.size = 2;
                track.event.channel = etype & 0x0f;
                track.event.data = [etype, d1, 0, 0];
                let event = track.event;
                handler.midi(&event);
            }

            // Running status: this byte is the first data byte of a message
            // reusing the previous event's status, channel and size.
            0x00..=0x7f => {
                let size = usize::from(self.tracks[index].event.size).min(4);
                self.tracks[index].event.data[1] = etype;
                for i in 2..size {
                    let b = self.read_byte();
                    self.tracks[index].event.data[i] = b;
                }
                let event = self.tracks[index].event;
                handler.midi(&event);
            }

            // Sysex, boundaries included in the delivered payload.
            0xf0 | 0xf7 => {
                let mut event = SysexEvent::new(self.tracks[index].id);
                let mut start = 0usize;
                let mut size = self.read_varlen() as u16;
                if etype == 0xf0 {
                    event.data[0] = etype;
                    start = 1;
                    size = size.wrapping_add(1);
                }
                event.size = size;
                let body = usize::from(size).saturating_sub(start);
                if usize::from(size) > EVENT_BUF_LEN {
                    // Too large for the buffer: skip it but keep the stream
                    // position consistent.
                    self.pos += body;
                } else {
                    self.read_into(&mut event.data[start..start + body]);
                    handler.sysex(&event);
                }
            }

            // Meta event.
            0xff => {
                let kind = self.read_byte();
                let length = self.read_varlen();
                let body_pos = self.pos;

                let mut event = MetaEvent::new(self.tracks[index].id, kind, length as u16);
                match kind {
                    META_END_OF_TRACK => {
                        self.tracks[index].end_of_track = true;
                    }
                    META_SET_TEMPO => {
                        let value = self.read_multi(3);
                        self.set_micros_per_quarter_note(value);
                        event.data[0] = (value >> 16) as u8;
                        event.data[1] = (value >> 8) as u8;
                        event.data[2] = value as u8;
                    }
                    META_TIME_SIGNATURE => {
                        let n = self.read_byte();
                        let d = self.read_byte();
                        // Denominator is encoded as a power of two.
                        let denominator = if d < 8 { 1u8 << d } else { 0 };
                        self.set_time_signature(n, denominator);
                        event.data[0] = n;
                        event.data[1] = d;
                    }
                    _ => {
                        let copied = (length as usize).min(EVENT_BUF_LEN - 1);
                        self.read_into(&mut event.data[..copied]);
                        // NUL terminated in case it is text.
                        event.data[copied] = 0;
                    }
                }
                handler.meta(&event);

                self.pos = body_pos + length as usize;
            }

            // Unidentifiable status byte: stop playing this track.
            _ => {
                self.tracks[index].end_of_track = true;
            }
        }
    }

    /// Dispatch the next due event on one track. Returns false once the
    /// track has no event ready, leaving the cursor untouched so the same
    /// delta time is re-examined on the next tick.
    fn track_next_event<H: MidiHandler>(
        &mut self,
        index: usize,
        tick_count: u32,
        handler: &mut H,
    ) -> bool {
        if self.tracks[index].end_of_track {
            return false;
        }

        self.pos = (self.tracks[index].start_offset + self.tracks[index].offset) as usize;
        self.tracks[index].elapsed_ticks += tick_count;

        let delta = self.read_varlen();
        if self.tracks[index].elapsed_ticks < delta {
            return false;
        }
        // Keep the overshoot rather than resetting to zero, so errors do
        // not accumulate across events.
        self.tracks[index].elapsed_ticks -= delta;

        self.parse_event(index, handler);

        let pos = self.pos as u32;
        let track = &mut self.tracks[index];
        track.offset = pos.saturating_sub(track.start_offset);
        track.end_of_track = track.end_of_track || track.offset >= track.length;
        true
    }

    // --- public transport ------------------------------------------------

    /// Advance playback to the given absolute microsecond time, dispatching
    /// any events that became due. Returns true if a tick boundary passed.
    pub fn update<H: MidiHandler>(&mut self, now_micros: u32, handler: &mut H) -> bool {
        self.now_micros = now_micros;

        if self.paused {
            return false;
        }

        if !self.synch_done {
            self.synch_tracks();
            self.synch_done = true;
        }

        let ticks = self.tick_clock();
        if ticks == 0 {
            return false;
        }

        for index in 0..self.tracks.len() {
            for n in 0..MAX_EVENTS_PER_BATCH {
                let carry = if n == 0 { ticks } else { 0 };
                if !self.track_next_event(index, carry, handler) {
                    break;
                }
            }
        }
        true
    }

    /// Send an all-notes-off burst on every channel.
    pub fn silence<H: MidiHandler>(&mut self, handler: &mut H) {
        let mut event = MidiEvent {
            track: 0,
            channel: 0,
            size: 3,
            data: [0xb0, crate::event::controller::ALL_NOTES_OFF, 0, 0],
        };
        for channel in 0..16u8 {
            event.channel = channel;
            event.data[0] = 0xb0 | channel;
            handler.midi(&event);
        }
    }

    /// Pause or resume. Pausing silences all channels; resuming re-baselines
    /// the tick clock so there is no catch-up burst.
    pub fn pause<H: MidiHandler>(&mut self, paused: bool, handler: &mut H) {
        self.paused = paused;
        if paused {
            self.silence(handler);
        } else {
            self.last_check_micros = self.now_micros;
        }
    }

    /// Rewind every track and re-synchronize the clock, without re-reading
    /// the file headers.
    pub fn restart<H: MidiHandler>(&mut self, handler: &mut H) {
        self.pause(true, handler);
        for track in &mut self.tracks {
            track.restart();
        }
        self.synch_done = false;
        self.pause(false, handler);
    }

    /// True once every track has finished. When looping is enabled a
    /// finished file restarts itself instead.
    pub fn is_finished<H: MidiHandler>(&mut self, handler: &mut H) -> bool {
        let finished = self.tracks.iter().all(|t| t.end_of_track);
        if finished && self.looping {
            self.restart(handler);
            return false;
        }
        finished
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn format(&self) -> u16 {
        self.format
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Current tempo in beats per minute.
    pub fn tempo(&self) -> u16 {
        self.tempo
    }

    pub fn ticks_per_quarter_note(&self) -> u16 {
        self.ticks_per_quarter_note
    }

    /// Current tick duration in microseconds.
    pub fn tick_time(&self) -> u32 {
        self.tick_time
    }
}
