use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SoundEffect {
    Join,
    Pop,
    GameOver,
}

/// Plays short cues on the host's machine. Injected so the controller never
/// touches an audio device.
pub trait EffectsPlayer: Send + Sync {
    fn play(&self, effect: SoundEffect);
}

/// Headless player: records the cue in the log and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEffects;

impl EffectsPlayer for LogEffects {
    fn play(&self, effect: SoundEffect) {
        debug!("Sound effect: {:?}", effect);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingEffects {
        played: Mutex<Vec<SoundEffect>>,
    }

    impl RecordingEffects {
        pub fn played(&self) -> Vec<SoundEffect> {
            self.played.lock().map(|v| v.clone()).unwrap_or_default()
        }
    }

    impl EffectsPlayer for RecordingEffects {
        fn play(&self, effect: SoundEffect) {
            self.played.lock().unwrap().push(effect);
        }
    }
}
