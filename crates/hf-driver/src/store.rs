//! Content store collaborator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use hf_mix::{SfxId, SoundData};

/// Looks up cached sample data by effect id.
///
/// The store owns the buffers and reclaims them; the engine only moves
/// the usefulness counter. A lookup bumps retention, the mixer drops it
/// when a channel finishes, and [`sweep`](ContentStore::sweep) gives the
/// store a chance to reclaim anything no longer retained.
pub trait ContentStore {
    fn sound(&self, id: SfxId) -> Option<Arc<SoundData>>;

    fn sweep(&self) {}
}

/// Simple in-memory store, used in tests and as a reference
/// implementation for the real lump-backed cache.
#[derive(Default)]
pub struct MemoryStore {
    sounds: Mutex<HashMap<SfxId, Arc<SoundData>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: SfxId, pcm: Vec<u8>) {
        if let Ok(mut sounds) = self.sounds.lock() {
            sounds.insert(id, Arc::new(SoundData::new(pcm)));
        }
    }

    pub fn contains(&self, id: SfxId) -> bool {
        self.sounds
            .lock()
            .map(|sounds| sounds.contains_key(&id))
            .unwrap_or(false)
    }
}

impl ContentStore for MemoryStore {
    fn sound(&self, id: SfxId) -> Option<Arc<SoundData>> {
        let sounds = self.sounds.lock().ok()?;
        let sound = sounds.get(&id)?;
        sound.retain();
        Some(sound.clone())
    }

    fn sweep(&self) {
        if let Ok(mut sounds) = self.sounds.lock() {
            sounds.retain(|_, sound| sound.usefulness() > 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_bumps_usefulness() {
        let store = MemoryStore::new();
        store.insert(1, vec![0x80; 8]);
        let sound = store.sound(1).unwrap();
        assert_eq!(sound.usefulness(), 1);
    }

    #[test]
    fn missing_id_returns_none() {
        let store = MemoryStore::new();
        assert!(store.sound(9).is_none());
    }

    #[test]
    fn sweep_reclaims_unretained_sounds() {
        let store = MemoryStore::new();
        store.insert(1, vec![0x80; 8]);
        store.insert(2, vec![0x80; 8]);

        let kept = store.sound(1).unwrap();
        store.sweep();
        assert!(store.contains(1));
        assert!(!store.contains(2));

        kept.release();
        store.sweep();
        assert!(!store.contains(1));
    }
}
