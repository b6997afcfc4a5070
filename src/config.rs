use std::time::Duration;

/// Engine tunables. Defaults follow the game's house rules.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub round_length: Duration,
    /// How much "add time" puts on the clock.
    pub extend_step: Duration,
    pub rounds_per_game: u32,
    /// Attempts at reaching the rendezvous service when a game starts.
    pub open_attempts: u32,
    pub open_retry_delay: Duration,
    /// Give up on sessions stuck connecting after this long. `None` waits
    /// forever.
    pub connect_timeout: Option<Duration>,
    pub tick_interval: Duration,
    pub chat_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            round_length: Duration::from_secs(60),
            extend_step: Duration::from_secs(30),
            rounds_per_game: 3,
            open_attempts: 3,
            open_retry_delay: Duration::from_millis(500),
            connect_timeout: None,
            tick_interval: Duration::from_secs(1),
            chat_history: 200,
        }
    }
}
