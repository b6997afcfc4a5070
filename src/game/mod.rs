pub mod bots;
pub mod controller;
pub mod effects;
pub mod engine;
pub mod timer;

pub use engine::{run_game_engine, EngineBackend, GameCommand, GameHandle, GameRequest};
