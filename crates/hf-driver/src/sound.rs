//! Sound-effect API over the mixer.

use std::sync::Arc;

use hf_mix::{Mixer, SfxId};

use crate::store::ContentStore;

/// Starts effects from the content store and mixes them for the output
/// adapter.
pub struct SfxPlayer {
    mixer: Mixer,
    store: Arc<dyn ContentStore + Send + Sync>,
    volume: i32,
}

impl SfxPlayer {
    pub fn new(
        store: Arc<dyn ContentStore + Send + Sync>,
        output_rate: u32,
        block_frames: usize,
        exclusive: &[SfxId],
    ) -> Self {
        Self {
            mixer: Mixer::new(output_rate, block_frames, exclusive),
            store,
            volume: 127,
        }
    }

    /// The menu/config sound volume. Stored for the game's start-sound
    /// calls; individual starts pass their own computed volume.
    pub fn set_volume(&mut self, volume: i32) {
        self.volume = volume;
    }

    pub fn volume(&self) -> i32 {
        self.volume
    }

    /// Look up the effect and claim a mixer channel for it. Returns the
    /// channel handle, or None when the store has no such sound.
    pub fn start(
        &mut self,
        id: SfxId,
        volume: i32,
        separation: i32,
        pitch: u8,
        now: i32,
    ) -> Option<u16> {
        let sound = self.store.sound(id)?;
        let step = self.mixer.pitch_step(pitch);
        Some(self.mixer.start(id, sound, volume, separation, step, now))
    }

    /// Kept for interface completeness; the legacy mixer never stops a
    /// channel by handle.
    pub fn stop(&mut self, handle: u16) {
        self.mixer.stop(handle);
    }

    pub fn is_playing(&self, handle: u16, now: i32) -> bool {
        self.mixer.is_playing(handle, now)
    }

    pub fn active_channels(&self) -> usize {
        self.mixer.active_channels()
    }

    /// Periodic cache maintenance: let the store reclaim anything whose
    /// usefulness has run out.
    pub fn update_cache(&mut self) {
        self.store.sweep();
    }

    /// Mix one block of interleaved stereo samples.
    pub fn mix_block(&mut self, out: &mut [i16], blend: bool) {
        self.mixer.mix_block(out, blend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use hf_mix::NATIVE_RATE;

    fn player_with(sounds: &[(SfxId, usize)]) -> (SfxPlayer, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for &(id, len) in sounds {
            store.insert(id, vec![0xff; len]);
        }
        let player = SfxPlayer::new(store.clone(), NATIVE_RATE, 512, &[]);
        (player, store)
    }

    #[test]
    fn start_claims_a_channel() {
        let (mut player, _) = player_with(&[(1, 64)]);
        let handle = player.start(1, 127, 128, 128, 0);
        assert!(handle.is_some());
        assert_eq!(player.active_channels(), 1);
    }

    #[test]
    fn unknown_effect_starts_nothing() {
        let (mut player, _) = player_with(&[]);
        assert_eq!(player.start(7, 127, 128, 128, 0), None);
        assert_eq!(player.active_channels(), 0);
    }

    #[test]
    fn finished_effect_becomes_reclaimable() {
        let (mut player, store) = player_with(&[(1, 32)]);
        player.start(1, 127, 128, 128, 0);

        let mut out = [0i16; 256]; // plays the 32 bytes out completely
        player.mix_block(&mut out, false);
        assert_eq!(player.active_channels(), 0);

        player.update_cache();
        assert!(!store.contains(1));
    }

    #[test]
    fn pitch_parameter_changes_playback_rate() {
        let (mut player, _) = player_with(&[(1, 200), (2, 200)]);
        player.start(1, 127, 128, 128, 0); // native speed
        player.start(2, 127, 128, 192, 1); // one octave up

        let mut out = [0i16; 64];
        player.mix_block(&mut out, false);
        // Both still active; the faster channel consumed twice the bytes.
        assert_eq!(player.active_channels(), 2);
    }
}
