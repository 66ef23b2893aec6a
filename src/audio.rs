use crate::block::TargetId;
use crate::costume::Sound;
use crate::runtime::RuntimeError;

/// Sound playback boundary. The runtime decides *when* to start and stop
/// and how long to wait; synthesis and mixing live behind this trait.
pub trait Audio {
  fn play_sound(
    &mut self,
    target: TargetId,
    sound: &Sound,
    volume: f64,
  ) -> Result<(), RuntimeError>;

  fn play_note(&mut self, key: f64, secs: f64, volume: f64) -> Result<(), RuntimeError>;

  fn stop_all(&mut self);

  /// Releases whatever the target was playing; called when a clone is
  /// deleted.
  fn stop_sounds_for(&mut self, target: TargetId);
}

/// Silence: timing still works because waits use the sound's metadata
/// duration, not the backend.
#[derive(Debug, Default)]
pub struct NullAudio;

impl Audio for NullAudio {
  fn play_sound(
    &mut self,
    _target: TargetId,
    sound: &Sound,
    _volume: f64,
  ) -> Result<(), RuntimeError> {
    log::debug!("audio: play {} ({}s)", sound.name, sound.duration_secs);
    Ok(())
  }

  fn play_note(&mut self, key: f64, secs: f64, _volume: f64) -> Result<(), RuntimeError> {
    log::debug!("audio: note {key} for {secs}s");
    Ok(())
  }

  fn stop_all(&mut self) {}

  fn stop_sounds_for(&mut self, _target: TargetId) {}
}
