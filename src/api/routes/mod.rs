pub mod game;
pub mod media;
