/// Fire-and-forget notification sounds
///
/// `rodio` output streams cannot move between threads, so playback lives on a
/// dedicated audio thread fed through a channel. Callers never wait on it and
/// never see its errors.
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rodio::{Decoder, OutputStream, Sink};
use tracing::{debug, info, warn};

/// Notification side effect used by the automation controller
pub trait Notifier: Send + Sync {
    /// Queue a sound; errors are logged and swallowed
    fn play(&self, sound: &Path);
}

enum AudioRequest {
    Play(PathBuf),
    Shutdown,
}

/// Plays sound files on a background audio thread
pub struct AudioNotifier {
    tx: Sender<AudioRequest>,
    thread: Option<JoinHandle<()>>,
}

impl AudioNotifier {
    pub fn spawn() -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        let thread = thread::Builder::new()
            .name("audio".into())
            .spawn(move || run_audio_thread(rx))?;

        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }
}

impl Notifier for AudioNotifier {
    fn play(&self, sound: &Path) {
        if self.tx.send(AudioRequest::Play(sound.to_path_buf())).is_err() {
            warn!("Audio thread is gone, dropping {}", sound.display());
        }
    }
}

impl Drop for AudioNotifier {
    fn drop(&mut self) {
        let _ = self.tx.send(AudioRequest::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn run_audio_thread(rx: Receiver<AudioRequest>) {
    let output = match OutputStream::try_default() {
        Ok(output) => Some(output),
        Err(err) => {
            warn!("No audio output available, notifications are muted: {err}");
            None
        }
    };
    let mut cache = HashMap::new();

    while let Ok(request) = rx.recv() {
        let path = match request {
            AudioRequest::Play(path) => path,
            AudioRequest::Shutdown => break,
        };
        let Some((_stream, handle)) = output.as_ref() else {
            continue;
        };

        let data = match read_cached(&mut cache, &path) {
            Ok(data) => data,
            Err(err) => {
                warn!("Failed to read sound {}: {err}", path.display());
                continue;
            }
        };

        // Decoder needs owned 'static data
        let result = Decoder::new(Cursor::new((*data).clone()))
            .map_err(|e| e.to_string())
            .and_then(|decoder| {
                let sink = Sink::try_new(handle).map_err(|e| e.to_string())?;
                sink.append(decoder);
                sink.detach();
                Ok(())
            });

        match result {
            Ok(()) => debug!("Playing {}", path.display()),
            Err(err) => warn!("Failed to play {}: {err}", path.display()),
        }
    }

    info!("Audio thread stopped");
}

/// Read a sound file once and serve later requests from memory
fn read_cached(
    cache: &mut HashMap<PathBuf, Arc<Vec<u8>>>,
    path: &Path,
) -> std::io::Result<Arc<Vec<u8>>> {
    if let Some(data) = cache.get(path) {
        return Ok(Arc::clone(data));
    }
    let data = Arc::new(std::fs::read(path)?);
    cache.insert(path.to_path_buf(), Arc::clone(&data));
    Ok(data)
}

/// Discards every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn play(&self, sound: &Path) {
        debug!("Notification muted: {}", sound.display());
    }
}

/// Remembers requested sounds instead of playing them
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    played: Mutex<Vec<PathBuf>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn played(&self) -> Vec<PathBuf> {
        self.played.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn play(&self, sound: &Path) {
        self.played.lock().push(sound.to_path_buf());
    }
}
