//! FM voice allocation and register programming.
//!
//! Consumes channel events dispatched by the sequencer and turns them into
//! ordered register writes. A fixed pool of hardware voices is partitioned
//! into a free list and an allocated list; when the pool is exhausted a
//! voice is stolen according to the configured driver generation, each of
//! which reproduces a distinct legacy allocator bit-for-bit.

use arrayvec::ArrayVec;
use tracing::trace;

use hf_midi::{status, MidiEvent, MidiHandler};

use crate::instrument::{InstrumentBank, InstrumentId};
use crate::io::{reg, ChipType, InitError, Opl, PortIo, VOICES_PER_ARRAY};
use crate::tables::{CURVE_LOOP_START, CURVE_OCTAVE_LEN, FREQUENCY_CURVE, VOLUME_TABLE};

/// Voice pool size with both OPL3 register arrays in use.
pub const MAX_VOICES: usize = VOICES_PER_ARRAY * 2;

/// MIDI channels tracked per song.
pub const MIDI_CHANNELS: usize = 16;

const PERCUSSION_LOG_LEN: usize = 16;

/// Operator register offsets for each voice slot within an array.
const VOICE_OPERATORS: [[u8; VOICES_PER_ARRAY]; 2] = [
    [0x00, 0x01, 0x02, 0x08, 0x09, 0x0a, 0x10, 0x11, 0x12],
    [0x03, 0x04, 0x05, 0x0b, 0x0c, 0x0d, 0x13, 0x14, 0x15],
];

/// Which legacy driver generation's allocation quirks to reproduce.
///
/// The generations differ in how a voice is stolen when the pool is
/// exhausted, in sub-voice key-on order, and in whether releasing the
/// second sub-voice of a double-voice instrument re-releases its slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DriverVersion {
    /// Earliest generation: steal from the highest-numbered MIDI channel,
    /// ignoring instrument priority.
    Gen1,
    /// Middle generation: steal by envelope-derived priority, restricted
    /// to all but the last three allocated slots.
    Gen2,
    /// Final generation: prefer stealing a secondary sub-voice or a voice
    /// on a channel numbered at or above the running candidate.
    #[default]
    Gen3,
}

/// Tunables carried over from the legacy driver's option strings.
#[derive(Clone, Copy, Debug, Default)]
pub struct SynthOptions {
    pub version: DriverVersion,
    /// Swap the pan direction to correct the legacy reversed-stereo defect.
    pub stereo_correct: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct ChannelState {
    /// Melodic program bound by the last program change.
    instrument: u8,
    /// Clipped volume used for level computation.
    volume: u32,
    /// Unclipped volume as last set by the volume controller.
    volume_base: u32,
    /// Pan bits for the feedback register (OPL3 channel A/B).
    pan_reg: u8,
    /// Pitch bend offset in 1/32-semitone steps, MSB only.
    bend: i32,
}

#[derive(Clone, Copy, Debug, Default)]
struct Voice {
    /// Slot number within the register array.
    index: u8,
    /// Modulator operator register offset.
    op1: u8,
    /// Carrier operator register offset.
    op2: u8,
    /// 0 for the first register array, 0x100 for the second.
    array: u16,
    instr: Option<InstrumentId>,
    sub_voice: u8,
    /// Channel-data slot currently using this voice.
    channel: Option<u8>,
    /// MIDI key that keyed the voice on.
    key: u8,
    /// Note actually sounding (differs for fixed-pitch instruments).
    note: u8,
    /// Cached frequency register value for delta-only writes.
    freq: u16,
    note_volume: u8,
    car_volume: u8,
    mod_volume: u8,
    reg_pan: u8,
    /// Envelope-derived steal priority.
    priority: u8,
}

/// The FM synthesis driver. Registers itself as the sequencer's event
/// handler via [`MidiHandler`].
pub struct FmSynth<P: PortIo> {
    opl: Opl<P>,
    bank: InstrumentBank,
    opl3: bool,
    num_voices: usize,

    voices: [Voice; MAX_VOICES],
    free: ArrayVec<u8, MAX_VOICES>,
    allocated: ArrayVec<u8, MAX_VOICES>,
    channels: [ChannelState; MIDI_CHANNELS],

    version: DriverVersion,
    stereo_correct: bool,
    current_music_volume: u32,
    start_music_volume: u32,

    // Diagnostic ring of recently keyed percussion; written, never read.
    percussion_log: [u8; PERCUSSION_LOG_LEN],
    percussion_count: usize,
}

impl<P: PortIo> FmSynth<P> {
    /// Full bring-up: probe the chip, initialize its registers and load the
    /// instrument bank.
    pub fn init(port: P, base: u16, bank_lump: &[u8], options: SynthOptions) -> Result<Self, InitError> {
        let (mut opl, chip) = Opl::init(port, base)?;
        opl.init_registers(chip == ChipType::Opl3);
        let bank = InstrumentBank::parse(bank_lump)?;
        Ok(Self::new(opl, chip, bank, options))
    }

    /// Assemble a driver from already initialized parts.
    pub fn new(opl: Opl<P>, chip: ChipType, bank: InstrumentBank, options: SynthOptions) -> Self {
        let opl3 = chip == ChipType::Opl3;
        let num_voices = if opl3 { MAX_VOICES } else { VOICES_PER_ARRAY };

        let mut synth = Self {
            opl,
            bank,
            opl3,
            num_voices,
            voices: [Voice::default(); MAX_VOICES],
            free: ArrayVec::new(),
            allocated: ArrayVec::new(),
            channels: [ChannelState::default(); MIDI_CHANNELS],
            version: options.version,
            stereo_correct: options.stereo_correct,
            current_music_volume: 0,
            start_music_volume: 0,
            percussion_log: [0; PERCUSSION_LOG_LEN],
            percussion_count: 0,
        };
        synth.init_voices();
        synth
    }

    fn init_voices(&mut self) {
        self.free.clear();
        self.allocated.clear();
        for i in 0..self.num_voices {
            let slot = i % VOICES_PER_ARRAY;
            self.voices[i] = Voice {
                index: slot as u8,
                op1: VOICE_OPERATORS[0][slot],
                op2: VOICE_OPERATORS[1][slot],
                array: ((i / VOICES_PER_ARRAY) as u16) << 8,
                ..Voice::default()
            };
            self.free.push(i as u8);
        }
    }

    /// Reset all channel state and capture the volume ceiling for the song
    /// about to start.
    pub fn start_song(&mut self) {
        for channel in &mut self.channels {
            channel.instrument = 0;
            channel.volume_base = 100;
            channel.volume = self.current_music_volume.min(channel.volume_base);
            channel.pan_reg = 0x30;
            channel.bend = 0;
        }
        self.start_music_volume = self.current_music_volume;
    }

    /// Set the global music volume and reclip every channel against it.
    pub fn set_music_volume(&mut self, volume: u32) {
        if self.current_music_volume == volume {
            return;
        }
        self.current_music_volume = volume;
        for ch in 0..MIDI_CHANNELS {
            if ch == 15 {
                self.set_channel_volume(ch, volume, false);
            } else {
                let base = self.channels[ch].volume_base;
                self.set_channel_volume(ch, base, false);
            }
        }
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn allocated_len(&self) -> usize {
        self.allocated.len()
    }

    pub fn total_voices(&self) -> usize {
        self.num_voices
    }

    /// Ring of recently keyed percussion notes. Diagnostic only; nothing
    /// in the driver reads it back.
    pub fn recent_percussion(&self) -> &[u8] {
        &self.percussion_log
    }

    // --- voice pool ------------------------------------------------------

    /// Take the next voice from the front of the free list.
    fn get_free_voice(&mut self) -> Option<usize> {
        if self.free.is_empty() {
            return None;
        }
        let voice = self.free.remove(0);
        self.allocated.push(voice);
        Some(usize::from(voice))
    }

    /// Release the allocated-list entry at `index` back to the free list.
    ///
    /// An out-of-range index empties both lists instead of failing; this
    /// reproduces the crash-recovery quirk of the legacy allocator and is
    /// deliberate, not an error path.
    pub fn release_allocated(&mut self, index: usize) {
        if index >= self.allocated.len() {
            self.allocated.clear();
            self.free.clear();
            return;
        }

        let voice = usize::from(self.allocated[index]);
        self.voice_key_off(voice);
        let double_voice = self.voices[voice].sub_voice != 0;
        self.voices[voice].channel = None;
        self.voices[voice].note = 0;

        self.allocated.remove(index);
        self.free.push(voice as u8);

        // The old generations release the slot again when it carried the
        // extra sub-voice, whatever occupies that slot by now.
        if double_voice && self.version != DriverVersion::Gen3 {
            self.release_allocated(index);
        }
    }

    fn voice_key_off(&mut self, voice: usize) {
        let v = self.voices[voice];
        self.opl
            .write_register((reg::VOICE_FREQ_HI + u16::from(v.index)) | v.array, (v.freq >> 8) as u8);
    }

    // --- voice stealing --------------------------------------------------

    fn steal_gen1(&mut self) {
        let mut result = 0;
        for i in 0..self.allocated.len() {
            if self.voice_channel(i) > self.voice_channel(result) {
                result = i;
            }
        }
        self.release_allocated(result);
    }

    fn steal_gen2(&mut self, channel: u8) {
        let mut result = 0;
        let mut priority = 0x8000i32;
        for i in 0..self.allocated.len().saturating_sub(3) {
            let voice = usize::from(self.allocated[i]);
            if i32::from(self.voices[voice].priority) < priority && self.voice_channel(i) >= channel {
                priority = i32::from(self.voices[voice].priority);
                result = i;
            }
        }
        self.release_allocated(result);
    }

    fn steal_gen3(&mut self) {
        // Prefer the extra voice of a double-voice instrument, and treat
        // lower-numbered channels as implicitly higher priority.
        let mut result = 0;
        for i in 0..self.allocated.len() {
            let voice = usize::from(self.allocated[i]);
            if self.voices[voice].sub_voice != 0 || self.voice_channel(i) >= self.voice_channel(result)
            {
                result = i;
            }
        }
        self.release_allocated(result);
    }

    fn voice_channel(&self, allocated_index: usize) -> u8 {
        let voice = usize::from(self.allocated[allocated_index]);
        self.voices[voice].channel.unwrap_or(0)
    }

    // --- register programming --------------------------------------------

    /// Program one operator, returning the level value cached for later
    /// delta-only volume writes.
    fn load_operator(&mut self, operator: u16, patch_op: crate::instrument::OperatorPatch, max_level: bool) -> u8 {
        let mut level = patch_op.scale;
        if max_level {
            level |= 0x3f;
        } else {
            level |= patch_op.level;
        }

        self.opl.write_register(reg::OPS_LEVEL + operator, level);
        self.opl.write_register(reg::OPS_TREMOLO + operator, patch_op.tremolo);
        self.opl.write_register(reg::OPS_ATTACK + operator, patch_op.attack);
        self.opl.write_register(reg::OPS_SUSTAIN + operator, patch_op.sustain);
        self.opl.write_register(reg::OPS_WAVEFORM + operator, patch_op.waveform);
        level
    }

    fn set_voice_instrument(&mut self, voice: usize, id: InstrumentId, sub_voice: u8) {
        if self.voices[voice].instr == Some(id) && self.voices[voice].sub_voice == sub_voice {
            return;
        }
        self.voices[voice].instr = Some(id);
        self.voices[voice].sub_voice = sub_voice;

        let patch = self.bank.voice_patch(id, sub_voice);
        let v = self.voices[voice];
        let modulating = patch.feedback & 0x01 == 0;

        // The carrier goes in first at minimum output; its real level is
        // set by the volume pass. In additive mode both operators start
        // at minimum.
        let car = self.load_operator(u16::from(v.op2) | v.array, patch.carrier, true);
        let modv = self.load_operator(u16::from(v.op1) | v.array, patch.modulator, !modulating);
        self.voices[voice].car_volume = car;
        self.voices[voice].mod_volume = modv;

        self.opl.write_register(
            (reg::VOICE_FEEDBACK + u16::from(v.index)) | v.array,
            patch.feedback | v.reg_pan,
        );

        self.voices[voice].priority =
            (0x0f - (patch.carrier.attack >> 4)) + (0x0f - (patch.carrier.sustain & 0x0f));
    }

    fn set_voice_volume(&mut self, voice: usize, volume: u8) {
        self.voices[voice].note_volume = volume;
        let v = self.voices[voice];
        let (Some(id), Some(channel)) = (v.instr, v.channel) else {
            return;
        };
        let patch = self.bank.voice_patch(id, v.sub_voice);

        // Two-stage non-linear mapping: note velocity and channel volume
        // both pass through the level table before being combined.
        let channel_volume = self.channels[usize::from(channel)].volume as usize;
        let midi_volume = 2 * (VOLUME_TABLE[channel_volume.min(127)] + 1);
        let mut full_volume = (VOLUME_TABLE[usize::from(v.note_volume).min(127)] * midi_volume) >> 9;
        if full_volume >= 0x3f {
            full_volume = 0x3f;
        }

        let car_volume = 0x3f - full_volume as u8;
        if car_volume != v.car_volume & 0x3f {
            self.voices[voice].car_volume = car_volume | (v.car_volume & 0xc0);
            let value = self.voices[voice].car_volume;
            self.opl
                .write_register((reg::OPS_LEVEL + u16::from(v.op2)) | v.array, value);

            // In additive feedback mode the modulator contributes output
            // directly and must track the carrier level.
            if patch.feedback & 0x01 != 0 && patch.modulator.level != 0x3f {
                let mut mod_volume = patch.modulator.level.max(car_volume);
                mod_volume |= v.mod_volume & 0xc0;
                if mod_volume != v.mod_volume {
                    self.voices[voice].mod_volume = mod_volume;
                    self.opl.write_register(
                        (reg::OPS_LEVEL + u16::from(v.op1)) | v.array,
                        mod_volume | (patch.modulator.scale & 0xc0),
                    );
                }
            }
        }
    }

    fn set_voice_pan(&mut self, voice: usize, pan: u8) {
        self.voices[voice].reg_pan = pan;
        let v = self.voices[voice];
        let Some(id) = v.instr else { return };
        let patch = self.bank.voice_patch(id, v.sub_voice);
        self.opl.write_register(
            (reg::VOICE_FEEDBACK + u16::from(v.index)) | v.array,
            patch.feedback | pan,
        );
    }

    fn frequency_for_voice(&self, voice: usize) -> u16 {
        let v = self.voices[voice];
        let Some(id) = v.instr else { return 0 };
        let instrument = self.bank.instrument(id);
        let patch = self.bank.voice_patch(id, v.sub_voice);

        let mut note = i32::from(v.note);
        if !instrument.fixed_pitch() {
            note += i32::from(patch.note_offset);
        }
        // Fold the note into range an octave at a time.
        while note < 0 {
            note += 12;
        }
        while note > 95 {
            note -= 12;
        }

        let bend = v.channel.map_or(0, |ch| self.channels[usize::from(ch)].bend);
        let mut freq_index = 64 + 32 * note + bend;

        // The second sub-voice is detuned by the instrument's fine tuning.
        if v.sub_voice != 0 {
            freq_index += i32::from(instrument.fine_tuning) / 2 - 64;
        }
        if freq_index < 0 {
            freq_index = 0;
        }

        let freq_index = freq_index as usize;
        if freq_index < CURVE_LOOP_START {
            return FREQUENCY_CURVE[freq_index];
        }

        let sub_index = (freq_index - CURVE_LOOP_START) % CURVE_OCTAVE_LEN;
        let mut octave = (freq_index - CURVE_LOOP_START) / CURVE_OCTAVE_LEN;
        // Only three bits of block number exist; octave 7 is reused above.
        if octave >= 7 {
            octave = 7;
        }

        FREQUENCY_CURVE[sub_index + CURVE_LOOP_START] | ((octave as u16) << 10)
    }

    fn update_voice_frequency(&mut self, voice: usize) {
        let freq = self.frequency_for_voice(voice);
        if self.voices[voice].freq != freq {
            let v = self.voices[voice];
            self.opl
                .write_register((reg::VOICE_FREQ_LO + u16::from(v.index)) | v.array, (freq & 0xff) as u8);
            self.opl.write_register(
                (reg::VOICE_FREQ_HI + u16::from(v.index)) | v.array,
                ((freq >> 8) | 0x20) as u8,
            );
            self.voices[voice].freq = freq;
        }
    }

    fn voice_key_on(&mut self, channel: u8, id: InstrumentId, sub_voice: u8, note: u8, key: u8, volume: u8) {
        let mut sub_voice = sub_voice;
        if !self.opl3 && self.version == DriverVersion::Gen1 {
            sub_voice = 0;
        }

        let Some(voice) = self.get_free_voice() else {
            return;
        };

        let instrument = self.bank.instrument(id);
        let sounding_note = if instrument.fixed_pitch() {
            instrument.fixed_note
        } else {
            note
        };

        self.voices[voice].channel = Some(channel);
        self.voices[voice].key = key;
        self.voices[voice].note = sounding_note;
        self.voices[voice].reg_pan = self.channels[usize::from(channel)].pan_reg;

        self.set_voice_instrument(voice, id, sub_voice);
        self.set_voice_volume(voice, volume);

        // Writing the frequency turns the note on.
        self.voices[voice].freq = 0;
        self.update_voice_frequency(voice);
    }

    // --- channel events --------------------------------------------------

    /// MIDI percussion lives on channel 9 but the channel data slot used
    /// is 15, a leftover of the driver's internal song format.
    fn channel_slot(event_channel: u8) -> u8 {
        match event_channel {
            9 => 15,
            15 => 9,
            other => other,
        }
    }

    fn key_on_event(&mut self, event: &MidiEvent) {
        let key = event.data[1];
        let mut note = event.data[1];
        let volume = event.data[2];

        // Key-on at zero velocity means key-off.
        if volume == 0 {
            self.key_off_event(event);
            return;
        }

        let channel = Self::channel_slot(event.channel);

        let id = if event.channel == 9 {
            let Some(index) = self.bank.percussion_for_key(key) else {
                return;
            };
            self.percussion_log[self.percussion_count] = key;
            self.percussion_count = (self.percussion_count + 1) % PERCUSSION_LOG_LEN;
            note = 60;
            InstrumentId::Percussion(index)
        } else {
            InstrumentId::Melodic(self.channels[usize::from(channel)].instrument)
        };

        let double_voice = self.bank.instrument(id).double_voice();

        match self.version {
            DriverVersion::Gen1 => {
                let mut needed = if double_voice { 2 } else { 1 };
                if !self.opl3 {
                    needed = 1;
                }
                while self.allocated.len() > self.num_voices - needed {
                    self.steal_gen1();
                }
                if double_voice {
                    self.voice_key_on(channel, id, 1, note, key, volume);
                }
                self.voice_key_on(channel, id, 0, note, key, volume);
            }
            DriverVersion::Gen2 => {
                if self.allocated.len() == self.num_voices {
                    self.steal_gen2(channel);
                }
                if self.allocated.len() == self.num_voices - 1 && double_voice {
                    self.steal_gen2(channel);
                }
                if double_voice {
                    self.voice_key_on(channel, id, 1, note, key, volume);
                }
                self.voice_key_on(channel, id, 0, note, key, volume);
            }
            DriverVersion::Gen3 => {
                if self.free.is_empty() {
                    self.steal_gen3();
                }
                self.voice_key_on(channel, id, 0, note, key, volume);
                if double_voice {
                    self.voice_key_on(channel, id, 1, note, key, volume);
                }
            }
        }
    }

    fn key_off_event(&mut self, event: &MidiEvent) {
        let channel = Self::channel_slot(event.channel);
        let key = event.data[1];

        let mut i = 0;
        while i < self.allocated.len() {
            let voice = usize::from(self.allocated[i]);
            if self.voices[voice].channel == Some(channel) && self.voices[voice].key == key {
                self.release_allocated(i);
            } else {
                i += 1;
            }
        }
    }

    fn all_notes_off(&mut self, channel: u8) {
        let mut i = 0;
        while i < self.allocated.len() {
            let voice = usize::from(self.allocated[i]);
            if self.voices[voice].channel == Some(channel) {
                self.release_allocated(i);
            } else {
                i += 1;
            }
        }
    }

    fn set_channel_volume(&mut self, channel: usize, volume: u32, clip_start: bool) {
        self.channels[channel].volume_base = volume;
        let mut volume = volume.min(self.current_music_volume);
        if clip_start {
            volume = volume.min(self.start_music_volume);
        }
        self.channels[channel].volume = volume << 3;

        for voice in 0..self.num_voices {
            if self.voices[voice].channel == Some(channel as u8) {
                let note_volume = self.voices[voice].note_volume;
                self.set_voice_volume(voice, note_volume);
            }
        }
    }

    fn set_channel_pan(&mut self, channel: usize, pan: u8) {
        // The legacy driver has the stereo channels backwards; the
        // correction option undoes that swap.
        let pan = if self.stereo_correct { 144 - u32::from(pan) } else { u32::from(pan) };

        if !self.opl3 {
            return;
        }

        let reg_pan = if pan >= 96 {
            0x10
        } else if pan <= 48 {
            0x20
        } else {
            0x30
        };

        if self.channels[channel].pan_reg != reg_pan {
            self.channels[channel].pan_reg = reg_pan;
            for voice in 0..self.num_voices {
                if self.voices[voice].channel == Some(channel as u8) {
                    self.set_voice_pan(voice, reg_pan);
                }
            }
        }
    }

    fn controller_event(&mut self, event: &MidiEvent) {
        let channel = usize::from(Self::channel_slot(event.channel));
        let controller = event.data[1];
        let param = event.data[2];

        match controller {
            hf_midi::controller::VOLUME_MSB => {
                self.set_channel_volume(channel, u32::from(param), true);
            }
            hf_midi::controller::PAN => self.set_channel_pan(channel, param),
            hf_midi::controller::ALL_NOTES_OFF => self.all_notes_off(channel as u8),
            other => trace!(controller = other, "ignored MIDI controller"),
        }
    }

    fn program_change_event(&mut self, event: &MidiEvent) {
        let channel = usize::from(Self::channel_slot(event.channel));
        // Rebinds future key-ons only; sounding voices keep their timbre.
        self.channels[channel].instrument = event.data[1];
    }

    fn pitch_bend_event(&mut self, event: &MidiEvent) {
        let channel = Self::channel_slot(event.channel);
        // Only the MSB of the bend value is honored.
        self.channels[usize::from(channel)].bend = i32::from(event.data[2]) - 64;

        // Retune this channel's voices and rotate them to the back of the
        // allocated list, deprioritizing them for stealing.
        let list = self.allocated.clone();
        let mut updated: ArrayVec<u8, MAX_VOICES> = ArrayVec::new();
        let mut untouched: ArrayVec<u8, MAX_VOICES> = ArrayVec::new();
        for entry in list {
            let voice = usize::from(entry);
            if self.voices[voice].channel == Some(channel) {
                self.update_voice_frequency(voice);
                updated.push(entry);
            } else {
                untouched.push(entry);
            }
        }
        self.allocated.clear();
        self.allocated.extend(untouched);
        self.allocated.extend(updated);
    }
}

impl<P: PortIo> MidiHandler for FmSynth<P> {
    fn midi(&mut self, event: &MidiEvent) {
        match event.data[0] & 0xf0 {
            status::NOTE_OFF => self.key_off_event(event),
            status::NOTE_ON => self.key_on_event(event),
            status::CONTROLLER => self.controller_event(event),
            status::PROGRAM_CHANGE => self.program_change_event(event),
            status::PITCH_BEND => self.pitch_bend_event(event),
            _ => {}
        }
    }
}
