//! Music driver facade: one active backend behind a uniform operation
//! set, with auto-probe selection and silent degradation when no backend
//! initializes.

use tracing::{info, warn};

use hf_opl::{PortIo, SynthOptions};

use crate::fm_backend::FmBackend;
use crate::midi_backend::{MidiOut, PortBackend};
use crate::transport::RegisterError;

/// Opaque token for a registered song.
///
/// Only one song is registered at a time; like the legacy interface, the
/// transport operations act on that song regardless of the handle value
/// passed back in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SongHandle(u32);

/// Which music backend to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MusicSelect {
    /// Probe FM synthesis first, then the raw MIDI port.
    #[default]
    Auto,
    FmSynth,
    MidiPort,
    Off,
}

/// Capability set every music backend implements.
pub trait MusicBackend {
    fn update(&mut self, elapsed_micros: u32);
    fn set_volume(&mut self, volume: u32);
    fn register(&mut self, data: &[u8]) -> Result<(), RegisterError>;
    fn unregister(&mut self);
    fn play(&mut self, looping: bool);
    fn stop(&mut self);
    fn pause(&mut self);
    fn resume(&mut self);
    fn is_playing(&self) -> bool;
    fn shutdown(&mut self);
}

/// FM backend construction inputs.
pub struct FmConfig<P: PortIo> {
    pub port: P,
    pub base: u16,
    pub bank_lump: Vec<u8>,
    pub options: SynthOptions,
}

/// Select and initialize a backend. Unavailable choices fall through the
/// probe order; total failure yields a disabled driver, not an error.
pub fn probe_music<P, M>(
    select: MusicSelect,
    fm: Option<FmConfig<P>>,
    midi_out: Option<M>,
) -> MusicDriver
where
    P: PortIo + Send + 'static,
    M: MidiOut + Send + 'static,
{
    let mut fm = fm;
    if matches!(select, MusicSelect::Auto | MusicSelect::FmSynth) {
        if let Some(config) = fm.take() {
            match FmBackend::new(config.port, config.base, &config.bank_lump, config.options) {
                Ok(backend) => {
                    info!("music: FM synthesis driver");
                    return MusicDriver::new(Box::new(backend));
                }
                Err(err) => warn!("FM synthesis unavailable: {err}"),
            }
        }
    }

    if matches!(select, MusicSelect::Auto | MusicSelect::MidiPort) {
        if let Some(out) = midi_out {
            info!("music: raw MIDI port driver");
            return MusicDriver::new(Box::new(PortBackend::new(out)));
        }
    }

    if select != MusicSelect::Off {
        warn!("music: no backend available, music disabled");
    }
    MusicDriver::disabled()
}

/// The facade. A disabled driver answers every operation with a no-op
/// failure value instead of propagating errors.
pub struct MusicDriver {
    backend: Option<Box<dyn MusicBackend + Send>>,
    registered: Option<SongHandle>,
    next_handle: u32,
}

impl MusicDriver {
    pub fn new(backend: Box<dyn MusicBackend + Send>) -> Self {
        Self {
            backend: Some(backend),
            registered: None,
            next_handle: 1,
        }
    }

    pub fn disabled() -> Self {
        Self {
            backend: None,
            registered: None,
            next_handle: 1,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn set_volume(&mut self, volume: u32) {
        if let Some(backend) = &mut self.backend {
            backend.set_volume(volume);
        }
    }

    /// Register a song, implicitly unregistering any previous one.
    /// Returns None when parsing fails or the driver is disabled.
    pub fn register_song(&mut self, data: &[u8]) -> Option<SongHandle> {
        let backend = self.backend.as_mut()?;
        if self.registered.take().is_some() {
            backend.unregister();
        }
        match backend.register(data) {
            Ok(()) => {
                let handle = SongHandle(self.next_handle);
                self.next_handle += 1;
                self.registered = Some(handle);
                Some(handle)
            }
            Err(err) => {
                warn!("song rejected: {err}");
                None
            }
        }
    }

    pub fn unregister_song(&mut self, _handle: SongHandle) {
        if let Some(backend) = &mut self.backend {
            if self.registered.take().is_some() {
                backend.unregister();
            }
        }
    }

    pub fn play_song(&mut self, _handle: SongHandle, looping: bool) {
        if let (Some(backend), Some(_)) = (&mut self.backend, self.registered) {
            backend.play(looping);
        }
    }

    pub fn stop_song(&mut self, _handle: SongHandle) {
        if let (Some(backend), Some(_)) = (&mut self.backend, self.registered) {
            backend.stop();
        }
    }

    pub fn pause_song(&mut self, _handle: SongHandle) {
        if let (Some(backend), Some(_)) = (&mut self.backend, self.registered) {
            backend.pause();
        }
    }

    pub fn resume_song(&mut self, _handle: SongHandle) {
        if let (Some(backend), Some(_)) = (&mut self.backend, self.registered) {
            backend.resume();
        }
    }

    /// False for any handle when no backend is active.
    pub fn query_playing(&self, _handle: SongHandle) -> bool {
        match &self.backend {
            Some(backend) => backend.is_playing(),
            None => false,
        }
    }

    /// Drive the active backend's sequencer clock.
    pub fn update(&mut self, elapsed_micros: u32) {
        if let Some(backend) = &mut self.backend {
            backend.update(elapsed_micros);
        }
    }

    /// Stop the song, poll until the backend reports not-playing, then
    /// release everything. The poll is a deliberate spin-wait so the
    /// periodic updater's own transitions are never raced.
    pub fn shutdown(&mut self) {
        let Some(mut backend) = self.backend.take() else {
            return;
        };
        backend.stop();
        while backend.is_playing() {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        backend.unregister();
        backend.shutdown();
        self.registered = None;
    }
}
