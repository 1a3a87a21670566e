pub mod config;
pub mod constants;
pub mod error;
pub mod languages;
pub mod logging;
pub mod span_hash;
pub mod time;
pub mod types;
pub mod vcs;
