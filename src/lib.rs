pub mod config;
pub mod gaps;
pub mod matching;
pub mod orchestrator;
pub mod progress;
pub mod recognition;
pub mod segment;
pub mod tracklist;

/// Application name for XDG paths
pub const APP_NAME: &str = "setid";
