//! Render loop gluing the mixer and music driver to the audio device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::warn;

use hf_audio::{AudioError, AudioOutput, Frame, LinearResampler};
use hf_mix::SfxId;

use crate::music::{MusicDriver, SongHandle};
use crate::sound::SfxPlayer;

/// Internal mixing rate; the store's samples are authored at this rate.
pub const INTERNAL_RATE: u32 = hf_mix::NATIVE_RATE;

/// Frames rendered per engine block.
pub const BLOCK_FRAMES: usize = 512;

/// Everything the render thread owns. API calls reach it through a short
/// critical section; the render thread is the only writer of playback
/// state between them.
pub struct EngineState {
    pub sfx: Option<SfxPlayer>,
    pub music: MusicDriver,
}

/// The running engine: one render thread that ticks the music driver,
/// mixes sound-effect blocks, converts them to the device rate and feeds
/// the output. Backpressure from the device paces the loop.
pub struct AudioCore {
    state: Arc<Mutex<EngineState>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AudioCore {
    /// Spawn the render thread. The output is constructed on the thread
    /// itself (device streams are not generally movable across threads);
    /// if that fails the engine degrades to silence rather than erroring.
    pub fn start<O, F>(state: EngineState, make_output: F) -> Self
    where
        O: AudioOutput,
        F: FnOnce() -> Result<O, AudioError> + Send + 'static,
    {
        let state = Arc::new(Mutex::new(state));
        let stop = Arc::new(AtomicBool::new(false));

        let thread = std::thread::spawn({
            let state = state.clone();
            let stop = stop.clone();
            move || {
                let mut output = match make_output() {
                    Ok(output) => output,
                    Err(err) => {
                        warn!("audio device unavailable, running silent: {err}");
                        return;
                    }
                };
                if let Err(err) = output.start() {
                    warn!("audio start failed: {err}");
                    return;
                }

                let device_rate = output.sample_rate();
                let mut resampler = LinearResampler::new(INTERNAL_RATE, device_rate);
                let mut block = vec![0i16; BLOCK_FRAMES * 2];
                let mut converted: Vec<i16> = Vec::new();
                let mut frames: Vec<Frame> = Vec::new();
                let mut last = Instant::now();

                while !stop.load(Ordering::Relaxed) {
                    let now = Instant::now();
                    let elapsed = now.duration_since(last).as_micros() as u32;
                    last = now;

                    {
                        let mut engine = lock_state(&state);
                        engine.music.update(elapsed);
                        match engine.sfx.as_mut() {
                            Some(sfx) => sfx.mix_block(&mut block, false),
                            None => block.fill(0),
                        }
                    }

                    resampler.convert(&block, &mut converted);
                    frames.clear();
                    frames.extend(Frame::from_interleaved(&converted));
                    output.write(&frames);
                }

                let _ = output.stop();
            }
        });

        Self {
            state,
            stop,
            thread: Some(thread),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        lock_state(&self.state)
    }

    // --- sound effects ---------------------------------------------------

    pub fn start_sound(&self, id: SfxId, volume: i32, separation: i32, pitch: u8, now: i32) -> Option<u16> {
        self.lock().sfx.as_mut()?.start(id, volume, separation, pitch, now)
    }

    pub fn stop_sound(&self, handle: u16) {
        if let Some(sfx) = self.lock().sfx.as_mut() {
            sfx.stop(handle);
        }
    }

    pub fn sound_is_playing(&self, handle: u16, now: i32) -> bool {
        self.lock()
            .sfx
            .as_ref()
            .is_some_and(|sfx| sfx.is_playing(handle, now))
    }

    pub fn set_sfx_volume(&self, volume: i32) {
        if let Some(sfx) = self.lock().sfx.as_mut() {
            sfx.set_volume(volume);
        }
    }

    /// Periodic cache maintenance, called from the game loop.
    pub fn update_sounds(&self) {
        if let Some(sfx) = self.lock().sfx.as_mut() {
            sfx.update_cache();
        }
    }

    // --- music -----------------------------------------------------------

    pub fn register_song(&self, data: &[u8]) -> Option<SongHandle> {
        self.lock().music.register_song(data)
    }

    pub fn unregister_song(&self, handle: SongHandle) {
        self.lock().music.unregister_song(handle);
    }

    pub fn play_song(&self, handle: SongHandle, looping: bool) {
        self.lock().music.play_song(handle, looping);
    }

    pub fn stop_song(&self, handle: SongHandle) {
        self.lock().music.stop_song(handle);
    }

    pub fn pause_song(&self, handle: SongHandle) {
        self.lock().music.pause_song(handle);
    }

    pub fn resume_song(&self, handle: SongHandle) {
        self.lock().music.resume_song(handle);
    }

    pub fn query_playing(&self, handle: SongHandle) -> bool {
        self.lock().music.query_playing(handle)
    }

    pub fn set_music_volume(&self, volume: u32) {
        self.lock().music.set_volume(volume);
    }

    /// Shut the engine down: silence the music driver (with its polling
    /// contract), then stop the render thread and the device.
    pub fn shutdown(mut self) {
        self.lock().music.shutdown();
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Lock the shared state, recovering from a poisoned mutex; a panicking
/// API caller must not silence audio forever.
fn lock_state(state: &Arc<Mutex<EngineState>>) -> MutexGuard<'_, EngineState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use hf_mix::NATIVE_RATE;
    use std::sync::mpsc;

    /// Output double: counts frames and hands blocks to a channel.
    struct SinkOutput {
        rate: u32,
        sender: mpsc::Sender<usize>,
    }

    impl AudioOutput for SinkOutput {
        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn write(&mut self, frames: &[Frame]) {
            let _ = self.sender.send(frames.len());
            // Pace roughly like a real device would.
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        fn start(&mut self) -> Result<(), AudioError> {
            Ok(())
        }

        fn stop(&mut self) -> Result<(), AudioError> {
            Ok(())
        }
    }

    fn engine_state() -> EngineState {
        let store = Arc::new(MemoryStore::new());
        store.insert(1, vec![0xff; 4096]);
        EngineState {
            sfx: Some(SfxPlayer::new(store, NATIVE_RATE, BLOCK_FRAMES, &[])),
            music: MusicDriver::disabled(),
        }
    }

    #[test]
    fn render_thread_produces_blocks_and_shuts_down() {
        let (sender, receiver) = mpsc::channel();
        let core = AudioCore::start(engine_state(), move || {
            Ok(SinkOutput { rate: NATIVE_RATE, sender })
        });

        let first = receiver.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert_eq!(first, BLOCK_FRAMES);

        assert!(core.start_sound(1, 127, 128, 128, 0).is_some());
        core.shutdown();
    }

    #[test]
    fn failed_output_degrades_to_silence() {
        let core = AudioCore::start(engine_state(), || {
            Err::<SinkOutput, _>(AudioError::NoDevice)
        });
        // The engine still answers API calls.
        assert!(core.start_sound(1, 127, 128, 128, 0).is_some());
        assert!(!core.query_playing(SongHandle::default()));
        core.shutdown();
    }
}
