//! General-MIDI-over-FM instrument bank.
//!
//! The bank lump carries 128 melodic programs followed by 47 percussion
//! definitions mapped to MIDI keys 35-81. Each record holds one or two
//! sub-voice definitions; double-voice instruments key two hardware voices
//! per note for a richer tone.

use thiserror::Error;

/// Melodic programs in the bank.
pub const NUM_MELODIC: usize = 128;

/// Percussion definitions in the bank.
pub const NUM_PERCUSSION: usize = 47;

/// First MIDI key with a percussion mapping.
pub const PERCUSSION_FIRST_KEY: u8 = 35;

/// Last MIDI key with a percussion mapping.
pub const PERCUSSION_LAST_KEY: u8 = 81;

const HEADER_LEN: usize = 8; // "#OPL_II#"
const OPERATOR_LEN: usize = 6;
const VOICE_LEN: usize = 16;
const RECORD_LEN: usize = 36;

/// Record flag: the instrument sounds a fixed note regardless of key.
pub const FLAG_FIXED_PITCH: u16 = 0x0001;

/// Record flag: the instrument keys both sub-voices per note.
pub const FLAG_DOUBLE_VOICE: u16 = 0x0004;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BankError {
    #[error("instrument bank truncated ({0} bytes)")]
    Truncated(usize),
}

/// Register values for one FM operator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperatorPatch {
    pub tremolo: u8,
    pub attack: u8,
    pub sustain: u8,
    pub waveform: u8,
    pub scale: u8,
    pub level: u8,
}

/// One sub-voice of an instrument.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VoicePatch {
    pub modulator: OperatorPatch,
    pub feedback: u8,
    pub carrier: OperatorPatch,
    /// Semitone offset applied to the sounding note.
    pub note_offset: i16,
}

/// One bank record: flags, tuning and up to two sub-voices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Instrument {
    pub flags: u16,
    pub fine_tuning: u8,
    pub fixed_note: u8,
    pub voices: [VoicePatch; 2],
}

impl Instrument {
    /// Fixed-pitch instruments ignore the played note.
    pub fn fixed_pitch(&self) -> bool {
        self.flags & FLAG_FIXED_PITCH != 0
    }

    /// Double-voice instruments consume two hardware voices per key-on.
    pub fn double_voice(&self) -> bool {
        self.flags & FLAG_DOUBLE_VOICE != 0
    }
}

/// Identifies an instrument within the bank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstrumentId {
    /// Melodic program number.
    Melodic(u8),
    /// Percussion table index (`key - 35`).
    Percussion(u8),
}

/// The parsed bank.
#[derive(Debug)]
pub struct InstrumentBank {
    melodic: Vec<Instrument>,
    percussion: Vec<Instrument>,
}

impl InstrumentBank {
    /// Parse a bank lump. The header content itself is not validated, only
    /// skipped, matching how the legacy driver loads it.
    pub fn parse(lump: &[u8]) -> Result<Self, BankError> {
        let needed = HEADER_LEN + (NUM_MELODIC + NUM_PERCUSSION) * RECORD_LEN;
        if lump.len() < needed {
            return Err(BankError::Truncated(lump.len()));
        }

        let mut offset = HEADER_LEN;
        let mut read_record = |offset: &mut usize| {
            let record = parse_record(&lump[*offset..*offset + RECORD_LEN]);
            *offset += RECORD_LEN;
            record
        };

        let melodic = (0..NUM_MELODIC).map(|_| read_record(&mut offset)).collect();
        let percussion = (0..NUM_PERCUSSION)
            .map(|_| read_record(&mut offset))
            .collect();

        Ok(Self { melodic, percussion })
    }

    pub fn melodic(&self, program: u8) -> &Instrument {
        &self.melodic[usize::from(program) % NUM_MELODIC]
    }

    /// Percussion definition for a MIDI key, if the key is mapped.
    pub fn percussion_for_key(&self, key: u8) -> Option<u8> {
        if (PERCUSSION_FIRST_KEY..=PERCUSSION_LAST_KEY).contains(&key) {
            Some(key - PERCUSSION_FIRST_KEY)
        } else {
            None
        }
    }

    pub(crate) fn instrument(&self, id: InstrumentId) -> &Instrument {
        match id {
            InstrumentId::Melodic(program) => self.melodic(program),
            InstrumentId::Percussion(index) => {
                &self.percussion[usize::from(index) % NUM_PERCUSSION]
            }
        }
    }

    pub(crate) fn voice_patch(&self, id: InstrumentId, sub_voice: u8) -> VoicePatch {
        self.instrument(id).voices[usize::from(sub_voice) & 1]
    }
}

fn parse_operator(data: &[u8]) -> OperatorPatch {
    OperatorPatch {
        tremolo: data[0],
        attack: data[1],
        sustain: data[2],
        waveform: data[3],
        scale: data[4],
        level: data[5],
    }
}

fn parse_voice(data: &[u8]) -> VoicePatch {
    VoicePatch {
        modulator: parse_operator(&data[0..OPERATOR_LEN]),
        feedback: data[6],
        carrier: parse_operator(&data[7..7 + OPERATOR_LEN]),
        // data[13] is unused padding.
        note_offset: i16::from_le_bytes([data[14], data[15]]),
    }
}

fn parse_record(data: &[u8]) -> Instrument {
    Instrument {
        flags: u16::from_le_bytes([data[0], data[1]]),
        fine_tuning: data[2],
        fixed_note: data[3],
        voices: [
            parse_voice(&data[4..4 + VOICE_LEN]),
            parse_voice(&data[4 + VOICE_LEN..4 + 2 * VOICE_LEN]),
        ],
    }
}

/// Serialize one record back to lump bytes. Test support.
#[cfg(test)]
pub(crate) fn record_bytes(instr: &Instrument) -> [u8; RECORD_LEN] {
    let mut out = [0u8; RECORD_LEN];
    out[0..2].copy_from_slice(&instr.flags.to_le_bytes());
    out[2] = instr.fine_tuning;
    out[3] = instr.fixed_note;
    for (slot, voice) in instr.voices.iter().enumerate() {
        let base = 4 + slot * VOICE_LEN;
        let m = &voice.modulator;
        out[base..base + 6]
            .copy_from_slice(&[m.tremolo, m.attack, m.sustain, m.waveform, m.scale, m.level]);
        out[base + 6] = voice.feedback;
        let c = &voice.carrier;
        out[base + 7..base + 13]
            .copy_from_slice(&[c.tremolo, c.attack, c.sustain, c.waveform, c.scale, c.level]);
        out[base + 14..base + 16].copy_from_slice(&voice.note_offset.to_le_bytes());
    }
    out
}

/// Build a full bank lump with every record set to `fill`. Test support.
#[cfg(test)]
pub(crate) fn bank_bytes(fill: &Instrument) -> Vec<u8> {
    let mut lump = b"#OPL_II#".to_vec();
    let record = record_bytes(fill);
    for _ in 0..NUM_MELODIC + NUM_PERCUSSION {
        lump.extend_from_slice(&record);
    }
    lump
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_instrument() -> Instrument {
        Instrument {
            flags: FLAG_DOUBLE_VOICE,
            fine_tuning: 0x82,
            fixed_note: 0,
            voices: [
                VoicePatch {
                    modulator: OperatorPatch {
                        tremolo: 0x21,
                        attack: 0xf2,
                        sustain: 0x73,
                        waveform: 1,
                        scale: 0x40,
                        level: 0x18,
                    },
                    feedback: 0x0a,
                    carrier: OperatorPatch {
                        tremolo: 0x31,
                        attack: 0xc4,
                        sustain: 0x95,
                        waveform: 2,
                        scale: 0x00,
                        level: 0x00,
                    },
                    note_offset: -12,
                },
                VoicePatch::default(),
            ],
        }
    }

    #[test]
    fn parses_round_trip_record() {
        let instr = sample_instrument();
        let lump = bank_bytes(&instr);
        let bank = InstrumentBank::parse(&lump).unwrap();
        assert_eq!(*bank.melodic(0), instr);
        assert_eq!(*bank.melodic(127), instr);
        assert_eq!(bank.instrument(InstrumentId::Percussion(0)), &instr);
    }

    #[test]
    fn rejects_truncated_lump() {
        let lump = bank_bytes(&Instrument::default());
        assert_eq!(
            InstrumentBank::parse(&lump[..lump.len() - 1]).unwrap_err(),
            BankError::Truncated(lump.len() - 1)
        );
    }

    #[test]
    fn percussion_key_range_is_35_to_81() {
        let bank = InstrumentBank::parse(&bank_bytes(&Instrument::default())).unwrap();
        assert_eq!(bank.percussion_for_key(34), None);
        assert_eq!(bank.percussion_for_key(35), Some(0));
        assert_eq!(bank.percussion_for_key(81), Some(46));
        assert_eq!(bank.percussion_for_key(82), None);
    }

    #[test]
    fn flag_helpers_decode_bits() {
        let mut instr = Instrument::default();
        assert!(!instr.fixed_pitch());
        assert!(!instr.double_voice());
        instr.flags = FLAG_FIXED_PITCH | FLAG_DOUBLE_VOICE;
        assert!(instr.fixed_pitch());
        assert!(instr.double_voice());
    }
}
