//! Shared sample buffers.

use std::sync::atomic::{AtomicI32, Ordering};

/// Sample rate the stored effects were recorded at.
pub const NATIVE_RATE: u32 = 11_025;

/// Raw 8-bit unsigned PCM owned by the content store and shared with the
/// mixer.
///
/// The usefulness counter is the cache-retention protocol: the store bumps
/// it when a sound is handed out, the mixer drops it when a channel
/// finishes (or is evicted while occupied). The store only reclaims a
/// buffer once the count is no longer positive; nothing here frees memory.
pub struct SoundData {
    pcm: Vec<u8>,
    usefulness: AtomicI32,
}

impl SoundData {
    pub fn new(pcm: Vec<u8>) -> Self {
        Self { pcm, usefulness: AtomicI32::new(0) }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.pcm
    }

    pub fn len(&self) -> usize {
        self.pcm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }

    /// Bump the retention count. Called by the content store on lookup.
    pub fn retain(&self) {
        self.usefulness.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one retention count.
    pub fn release(&self) {
        self.usefulness.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn usefulness(&self) -> i32 {
        self.usefulness.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usefulness_counts_retains_and_releases() {
        let sound = SoundData::new(vec![0x80; 16]);
        assert_eq!(sound.usefulness(), 0);
        sound.retain();
        sound.retain();
        sound.release();
        assert_eq!(sound.usefulness(), 1);
    }
}
