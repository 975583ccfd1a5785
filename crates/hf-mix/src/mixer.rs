//! The fixed channel bank and mix loop.

use std::sync::Arc;

use crate::sample::{SoundData, NATIVE_RATE};
use crate::volume::{stereo_gains, VolumeTables};

/// Concurrently playing effect channels. Hardware-determined; starting
/// more sounds evicts the channel with the oldest start time.
pub const NUM_CHANNELS: usize = 4;

/// Game-level identifier of a sound effect.
pub type SfxId = u16;

#[derive(Default)]
struct Channel {
    /// Channels with no sample data are inactive and skipped everywhere.
    sound: Option<Arc<SoundData>>,
    id: SfxId,
    handle: u16,
    /// Integer read index into the sample bytes.
    position: u32,
    /// Q16.16 resampling step.
    step: u32,
    /// Fractional position carried between output frames.
    step_remainder: u32,
    /// Caller-supplied start time, used for oldest-channel eviction.
    start: i32,
    left_volume: u8,
    right_volume: u8,
}

/// The sound-effects mixer.
///
/// Everything is preallocated at construction; the mix path performs no
/// allocation and never blocks.
pub struct Mixer {
    channels: [Channel; NUM_CHANNELS],
    tables: VolumeTables,
    step_table: [u32; 256],
    scratch: Vec<i32>,
    handle_counter: u16,
    /// Effects that may only play on one channel at a time.
    exclusive: Vec<SfxId>,
}

impl Mixer {
    /// Build a mixer for the given output rate. `block_frames` sizes the
    /// accumulation buffer; `exclusive` lists the one-at-a-time effects.
    pub fn new(output_rate: u32, block_frames: usize, exclusive: &[SfxId]) -> Self {
        Self {
            channels: Default::default(),
            tables: VolumeTables::new(),
            step_table: build_step_table(output_rate),
            scratch: vec![0; block_frames * 2],
            handle_counter: 0,
            exclusive: exclusive.to_vec(),
        }
    }

    /// Q16.16 resampling step for a pitch index (128 = native speed, 64
    /// steps per octave).
    pub fn pitch_step(&self, pitch: u8) -> u32 {
        self.step_table[usize::from(pitch)]
    }

    /// Claim a channel and start an effect on it. Returns the handle.
    pub fn start(
        &mut self,
        id: SfxId,
        sound: Arc<SoundData>,
        volume: i32,
        separation: i32,
        step: u32,
        now: i32,
    ) -> u16 {
        // One-at-a-time effects: silence the channel already carrying this
        // effect before claiming a fresh slot.
        if self.exclusive.contains(&id) {
            for channel in &mut self.channels {
                if channel.sound.is_some() && channel.id == id {
                    channel.sound = None;
                    break;
                }
            }
        }

        // Find the oldest occupied channel; the scan stops at the first
        // free slot, which wins if there is one.
        let mut oldest = now;
        let mut oldest_index = 0;
        let mut index = 0;
        while index < NUM_CHANNELS && self.channels[index].sound.is_some() {
            if self.channels[index].start < oldest {
                oldest_index = index;
                oldest = self.channels[index].start;
            }
            index += 1;
        }
        let slot = if index == NUM_CHANNELS { oldest_index } else { index };

        // Evicting a live channel costs its sample a retention point.
        if let Some(evicted) = &self.channels[slot].sound {
            evicted.release();
        }

        // Handles count upward from 100 and wrap within u16 range.
        if self.handle_counter == 0 {
            self.handle_counter = 100;
        }
        let handle = self.handle_counter;
        self.handle_counter = self.handle_counter.wrapping_add(1);

        let (left, right) = stereo_gains(volume, separation);
        let channel = &mut self.channels[slot];
        channel.sound = Some(sound);
        channel.id = id;
        channel.handle = handle;
        channel.position = 0;
        channel.step = step;
        channel.step_remainder = 0;
        channel.start = now;
        channel.left_volume = left as u8;
        channel.right_volume = right as u8;

        handle
    }

    /// Stopping by handle was never implemented by the legacy mixer;
    /// channels only end by playing out or being evicted.
    pub fn stop(&mut self, _handle: u16) {}

    /// Legacy liveness check: compares the clock against the handle value
    /// itself. Kept exactly as the original answers it.
    pub fn is_playing(&self, handle: u16, now: i32) -> bool {
        now < i32::from(handle)
    }

    pub fn active_channels(&self) -> usize {
        self.channels.iter().filter(|c| c.sound.is_some()).count()
    }

    /// Resample and mix every active channel into `out` (interleaved
    /// stereo), saturating to the 16-bit range. With `blend` set the
    /// accumulator is added to the buffer's existing content before
    /// clamping instead of overwriting it.
    pub fn mix_block(&mut self, out: &mut [i16], blend: bool) {
        let frames = out.len() / 2;
        if self.scratch.len() < frames * 2 {
            // Only reachable if the device renegotiates a larger block.
            self.scratch.resize(frames * 2, 0);
        }
        let scratch = &mut self.scratch[..frames * 2];
        scratch.fill(0);

        for channel in &mut self.channels {
            let Some(sound) = &channel.sound else {
                continue;
            };
            let data = sound.bytes();
            let length = data.len() as u32;

            let mut position = channel.position;
            let mut remainder = channel.step_remainder;
            let step = channel.step.max(1);
            let left = self.tables.row(channel.left_volume);
            let right = self.tables.row(channel.right_volume);

            // Output frames left before the read index runs off the data.
            let available = (u64::from(length.saturating_sub(position)) << 16) / u64::from(step);
            let end_of_sample = (frames as u64) > available;
            let span = if end_of_sample { available as usize } else { frames };

            for frame in 0..span {
                let byte = usize::from(data.get(position as usize).copied().unwrap_or(0x80));
                scratch[frame * 2] += left[byte];
                scratch[frame * 2 + 1] += right[byte];

                remainder += step;
                position += remainder >> 16;
                remainder &= 0xffff;
            }

            if end_of_sample {
                // The sole path by which the sample becomes reclaimable.
                sound.release();
                channel.sound = None;
            }
            channel.position = position;
            channel.step_remainder = remainder;
        }

        for (slot, value) in out.iter_mut().zip(scratch.iter()) {
            let mixed = if blend { *value + i32::from(*slot) } else { *value };
            *slot = mixed.clamp(-0x8000, 0x7fff) as i16;
        }
    }
}

/// Step widths for the pitch parameter: `2^((pitch-128)/64)` scaled by the
/// native-to-output rate ratio, in Q16.16.
fn build_step_table(output_rate: u32) -> [u32; 256] {
    let mut table = [0u32; 256];
    for pitch in -128i32..128 {
        let step = libm::pow(2.0, f64::from(pitch) / 64.0) * 65536.0;
        let scaled = (step as i64 * i64::from(NATIVE_RATE)) / i64::from(output_rate.max(1));
        table[(pitch + 128) as usize] = scaled as u32;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    const PISTOL: SfxId = 1;
    const SAW_IDLE: SfxId = 2;
    const THUD: SfxId = 40;

    fn mixer() -> Mixer {
        Mixer::new(NATIVE_RATE, 512, &[PISTOL, SAW_IDLE])
    }

    fn loud_sound(len: usize) -> Arc<SoundData> {
        Arc::new(SoundData::new(vec![0xff; len]))
    }

    fn start_simple(mixer: &mut Mixer, id: SfxId, sound: &Arc<SoundData>, now: i32) -> u16 {
        sound.retain();
        mixer.start(id, sound.clone(), 127, 128, 1 << 16, now)
    }

    #[test]
    fn pitch_step_is_identity_at_native_rate() {
        let m = mixer();
        assert_eq!(m.pitch_step(128), 1 << 16);
        assert_eq!(m.pitch_step(192), 2 << 16);
    }

    #[test]
    fn pitch_step_scales_with_output_rate() {
        let m = Mixer::new(44_100, 512, &[]);
        assert_eq!(m.pitch_step(128), 16_384);
    }

    #[test]
    fn handles_count_from_one_hundred() {
        let mut m = mixer();
        let sound = loud_sound(64);
        assert_eq!(start_simple(&mut m, THUD, &sound, 0), 100);
        assert_eq!(start_simple(&mut m, THUD, &sound, 1), 101);
    }

    #[test]
    fn one_to_one_step_consumes_one_byte_per_frame() {
        let mut m = mixer();
        let sound = loud_sound(100);
        start_simple(&mut m, THUD, &sound, 0);

        let mut out = [0i16; 100]; // 50 frames
        m.mix_block(&mut out, false);

        assert_eq!(m.active_channels(), 1);
        assert_eq!(m.channels[0].position, 50);
    }

    #[test]
    fn playing_out_deactivates_and_releases() {
        let mut m = mixer();
        let sound = loud_sound(100);
        start_simple(&mut m, THUD, &sound, 0);
        assert_eq!(sound.usefulness(), 1);

        let mut out = [0i16; 400]; // 200 frames, beyond the 100 bytes
        m.mix_block(&mut out, false);

        assert_eq!(m.active_channels(), 0);
        assert_eq!(sound.usefulness(), 0);
    }

    #[test]
    fn mix_applies_volume_lookup() {
        let mut m = mixer();
        let sound = loud_sound(100);
        // Full volume, hard left.
        sound.retain();
        m.start(THUD, sound.clone(), 127, 0, 1 << 16, 0);

        let mut out = [0i16; 8];
        m.mix_block(&mut out, false);

        assert_eq!(out[0], 127 * 256); // 0xff through the volume table
        assert_eq!(out[1], 0); // right ear silent
    }

    #[test]
    fn concurrent_channels_saturate() {
        let mut m = mixer();
        let sound = loud_sound(100);
        for now in 0..3 {
            sound.retain();
            m.start(THUD, sound.clone(), 127, 0, 1 << 16, now);
        }

        let mut out = [0i16; 8];
        m.mix_block(&mut out, false);
        assert_eq!(out[0], 0x7fff);
    }

    #[test]
    fn blend_mode_adds_to_existing_content() {
        let mut m = mixer();
        let sound = loud_sound(100);
        start_simple(&mut m, THUD, &sound, 0);

        let mut out = [1000i16; 8];
        m.mix_block(&mut out, true);
        assert_eq!(out[0], (127i32 * 256 + 1000) as i16);

        // Without blending the prior content is overwritten.
        let sound2 = loud_sound(100);
        start_simple(&mut m, THUD, &sound2, 1);
        let mut out = [1000i16; 8];
        m.mix_block(&mut out, false);
        assert!((out[0] as i32) <= 2 * 127 * 256);
    }

    #[test]
    fn oversubscription_evicts_oldest_start() {
        let mut m = mixer();
        let sounds: Vec<_> = (0..NUM_CHANNELS + 1).map(|_| loud_sound(64)).collect();
        for (i, sound) in sounds.iter().enumerate().take(NUM_CHANNELS) {
            start_simple(&mut m, THUD + i as SfxId, sound, 10 + i as i32);
        }
        assert_eq!(m.active_channels(), NUM_CHANNELS);

        // The newcomer lands on the channel that started at time 10.
        start_simple(&mut m, 99, &sounds[NUM_CHANNELS], 50);
        assert_eq!(m.active_channels(), NUM_CHANNELS);
        assert_eq!(m.channels[0].id, 99);
        assert_eq!(sounds[0].usefulness(), 0, "evicted sample loses its retention");
    }

    #[test]
    fn eviction_tie_resolves_to_lowest_index() {
        let mut m = mixer();
        let sounds: Vec<_> = (0..NUM_CHANNELS + 1).map(|_| loud_sound(64)).collect();
        for (i, sound) in sounds.iter().enumerate().take(NUM_CHANNELS) {
            start_simple(&mut m, THUD + i as SfxId, sound, 7);
        }
        start_simple(&mut m, 99, &sounds[NUM_CHANNELS], 9);
        assert_eq!(m.channels[0].id, 99);
        assert_eq!(m.channels[1].id, THUD + 1);
    }

    #[test]
    fn exclusive_effect_plays_on_one_channel_only() {
        let mut m = mixer();
        let first = loud_sound(64);
        let second = loud_sound(64);
        start_simple(&mut m, PISTOL, &first, 0);
        start_simple(&mut m, PISTOL, &second, 1);

        let pistols = m
            .channels
            .iter()
            .filter(|c| c.sound.is_some() && c.id == PISTOL)
            .count();
        assert_eq!(pistols, 1);
    }

    #[test]
    fn non_exclusive_effects_stack_freely() {
        let mut m = mixer();
        let sound = loud_sound(64);
        start_simple(&mut m, THUD, &sound, 0);
        start_simple(&mut m, THUD, &sound, 1);
        assert_eq!(m.active_channels(), 2);
    }

    #[test]
    fn stop_is_a_noop() {
        let mut m = mixer();
        let sound = loud_sound(64);
        let handle = start_simple(&mut m, THUD, &sound, 0);
        m.stop(handle);
        assert_eq!(m.active_channels(), 1);
    }

    #[test]
    fn is_playing_compares_clock_to_handle() {
        let m = mixer();
        assert!(m.is_playing(100, 50));
        assert!(!m.is_playing(100, 150));
    }

    #[test]
    fn fractional_steps_carry_remainder() {
        let mut m = mixer();
        let sound = loud_sound(100);
        sound.retain();
        m.start(THUD, sound, 127, 128, 1 << 15, 0); // half speed

        let mut out = [0i16; 100]; // 50 frames
        m.mix_block(&mut out, false);
        assert_eq!(m.channels[0].position, 25);
        assert_eq!(m.channels[0].step_remainder, 0);
    }
}
