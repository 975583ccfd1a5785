//! Timed register writes to the synthesis chip.

use thiserror::Error;

/// Hardware voices per register array (one array on OPL2, two on OPL3).
pub const VOICES_PER_ARRAY: usize = 9;

/// Operator slots per register array.
pub const NUM_OPERATORS: u16 = 21;

/// Register map. `0x100` in a register number selects the second OPL3 array.
pub mod reg {
    pub const WAVEFORM_ENABLE: u16 = 0x01;
    pub const TIMER1: u16 = 0x02;
    pub const TIMER2: u16 = 0x03;
    pub const TIMER_CTRL: u16 = 0x04;
    pub const FM_MODE: u16 = 0x08;
    /// Per-operator tremolo/vibrato/sustain/KSR flags.
    pub const OPS_TREMOLO: u16 = 0x20;
    /// Per-operator key scale + output level.
    pub const OPS_LEVEL: u16 = 0x40;
    /// Per-operator attack/decay rates.
    pub const OPS_ATTACK: u16 = 0x60;
    /// Per-operator sustain level/release rate.
    pub const OPS_SUSTAIN: u16 = 0x80;
    /// Per-voice frequency number, low byte.
    pub const VOICE_FREQ_LO: u16 = 0xA0;
    /// Per-voice block/octave + key-on bit + frequency high bits.
    pub const VOICE_FREQ_HI: u16 = 0xB0;
    /// Per-voice feedback/connection (and OPL3 channel A/B pan bits).
    pub const VOICE_FEEDBACK: u16 = 0xC0;
    /// Per-operator waveform select.
    pub const OPS_WAVEFORM: u16 = 0xE0;
    /// OPL3 "new" mode enable.
    pub const NEW_MODE: u16 = 0x105;
}

/// Port offsets from the chip's base port.
const PORT_REGISTER: u16 = 0;
const PORT_DATA: u16 = 1;
const PORT_REGISTER_ARRAY2: u16 = 2;

/// Byte-granularity port I/O with microsecond delays. The sole collaborator
/// the register layer talks to.
pub trait PortIo {
    fn write(&mut self, port: u16, value: u8);
    fn read(&mut self, port: u16) -> u8;
    fn delay_micros(&mut self, micros: u64);
}

/// Chip generation reported by the detection probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChipType {
    Opl2,
    Opl3,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InitError {
    #[error("FM chip not responding")]
    ChipMissing,
    #[error(transparent)]
    InstrumentBank(#[from] crate::instrument::BankError),
}

/// Register-level access to the chip.
///
/// Writes are separated by minimum delay intervals the chip requires;
/// index-select and data writes use distinct delays, shortened when an
/// OPL3 is detected. This is a hard ordering constraint of the hardware.
#[derive(Debug)]
pub struct Opl<P: PortIo> {
    port: P,
    base: u16,
    delay_index: u64,
    delay_data: u64,
}

impl<P: PortIo> Opl<P> {
    /// Wrap a port without probing. Delays default to the conservative
    /// OPL2 values.
    pub fn with_port(port: P, base: u16) -> Self {
        Self { port, base, delay_index: 5, delay_data: 35 }
    }

    /// Probe for a chip at `base`. On success the write delays are tuned
    /// to the detected generation.
    pub fn init(port: P, base: u16) -> Result<(Self, ChipType), InitError> {
        let mut opl = Self::with_port(port, base);
        let chip = opl.detect().ok_or(InitError::ChipMissing)?;
        if chip == ChipType::Opl3 {
            opl.delay_index = 1;
            opl.delay_data = 1;
        }
        Ok((opl, chip))
    }

    /// Borrow the underlying port collaborator.
    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn read_status(&mut self) -> u8 {
        self.port.read(self.base + PORT_REGISTER)
    }

    /// Select a register, wait, write its value, wait.
    pub fn write_register(&mut self, register: u16, value: u8) {
        if register & 0x100 != 0 {
            self.port
                .write(self.base + PORT_REGISTER_ARRAY2, (register - 0x100) as u8);
        } else {
            self.port.write(self.base + PORT_REGISTER, register as u8);
        }
        self.port.delay_micros(self.delay_index);
        self.port.write(self.base + PORT_DATA, value);
        self.port.delay_micros(self.delay_data);
    }

    /// Timer-based presence probe distinguishing no chip, OPL2 and OPL3.
    pub fn detect(&mut self) -> Option<ChipType> {
        // Reset both timers, then enable interrupts.
        self.write_register(reg::TIMER_CTRL, 0x60);
        self.write_register(reg::TIMER_CTRL, 0x80);
        let before = self.read_status();

        // Arm and start timer 1, give it time to expire.
        self.write_register(reg::TIMER1, 0xff);
        self.write_register(reg::TIMER_CTRL, 0x21);
        self.port.delay_micros(2000);
        let after = self.read_status();

        self.write_register(reg::TIMER_CTRL, 0x60);
        self.write_register(reg::TIMER_CTRL, 0x80);

        if before & 0xe0 == 0x00 && after & 0xe0 == 0xc0 {
            if after & 0x06 == 0x00 {
                Some(ChipType::Opl3)
            } else {
                Some(ChipType::Opl2)
            }
        } else {
            None
        }
    }

    /// Bring every register to its startup value.
    ///
    /// The sweeps deliberately run one past the operator count and touch a
    /// few registers that do not exist; that is what the original driver
    /// writes, and the chip tolerates it.
    pub fn init_registers(&mut self, opl3: bool) {
        for r in reg::OPS_LEVEL..=reg::OPS_LEVEL + NUM_OPERATORS {
            self.write_register(r, 0x3f);
        }
        for r in reg::OPS_ATTACK..=reg::OPS_WAVEFORM + NUM_OPERATORS {
            self.write_register(r, 0x00);
        }
        for r in 1..reg::OPS_LEVEL {
            self.write_register(r, 0x00);
        }

        self.write_register(reg::TIMER_CTRL, 0x60);
        self.write_register(reg::TIMER_CTRL, 0x80);
        self.write_register(reg::WAVEFORM_ENABLE, 0x20);

        if opl3 {
            self.write_register(reg::NEW_MODE, 0x01);
            for r in reg::OPS_LEVEL..=reg::OPS_LEVEL + NUM_OPERATORS {
                self.write_register(r | 0x100, 0x3f);
            }
            for r in reg::OPS_ATTACK..=reg::OPS_WAVEFORM + NUM_OPERATORS {
                self.write_register(r | 0x100, 0x00);
            }
            for r in 1..reg::OPS_LEVEL {
                self.write_register(r | 0x100, 0x00);
            }
        }

        // Keyboard split point.
        self.write_register(reg::FM_MODE, 0x40);

        if opl3 {
            self.write_register(reg::NEW_MODE, 0x01);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Port double recording writes/delays and replaying scripted reads.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedPort {
        pub writes: Vec<(u16, u8)>,
        pub delays: Vec<u64>,
        pub reads: VecDeque<u8>,
    }

    impl PortIo for ScriptedPort {
        fn write(&mut self, port: u16, value: u8) {
            self.writes.push((port, value));
        }

        fn read(&mut self, _port: u16) -> u8 {
            self.reads.pop_front().unwrap_or(0xff)
        }

        fn delay_micros(&mut self, micros: u64) {
            self.delays.push(micros);
        }
    }

    #[test]
    fn write_register_sequences_index_then_data() {
        let mut opl = Opl::with_port(ScriptedPort::default(), 0x388);
        opl.write_register(reg::OPS_LEVEL, 0x3f);

        let port = &opl.port;
        assert_eq!(port.writes, vec![(0x388, 0x40), (0x389, 0x3f)]);
        assert_eq!(port.delays, vec![5, 35]);
    }

    #[test]
    fn write_register_second_array_uses_third_port() {
        let mut opl = Opl::with_port(ScriptedPort::default(), 0x388);
        opl.write_register(reg::OPS_LEVEL | 0x100, 0x00);
        assert_eq!(opl.port.writes[0], (0x38a, 0x40));
        assert_eq!(opl.port.writes[1], (0x389, 0x00));
    }

    fn detect_with(status: [u8; 2]) -> Option<ChipType> {
        let port = ScriptedPort {
            reads: VecDeque::from(vec![status[0], status[1]]),
            ..ScriptedPort::default()
        };
        Opl::with_port(port, 0x388).detect()
    }

    #[test]
    fn detect_recognizes_opl3() {
        assert_eq!(detect_with([0x00, 0xc0]), Some(ChipType::Opl3));
    }

    #[test]
    fn detect_recognizes_opl2() {
        assert_eq!(detect_with([0x00, 0xc2]), Some(ChipType::Opl2));
    }

    #[test]
    fn detect_reports_missing_chip() {
        assert_eq!(detect_with([0xff, 0xff]), None);
    }

    #[test]
    fn init_shortens_delays_for_opl3() {
        let port = ScriptedPort {
            reads: VecDeque::from(vec![0x00, 0xc0]),
            ..ScriptedPort::default()
        };
        let (mut opl, chip) = Opl::init(port, 0x388).unwrap();
        assert_eq!(chip, ChipType::Opl3);

        opl.port.delays.clear();
        opl.write_register(reg::OPS_LEVEL, 0x00);
        assert_eq!(opl.port.delays, vec![1, 1]);
    }

    #[test]
    fn init_fails_without_chip() {
        let port = ScriptedPort {
            reads: VecDeque::from(vec![0xff, 0xff]),
            ..ScriptedPort::default()
        };
        assert_eq!(Opl::init(port, 0x388).unwrap_err(), InitError::ChipMissing);
    }
}
