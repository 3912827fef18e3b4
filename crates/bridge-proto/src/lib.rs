//! Wire protocol, lyric parsing and configuration shared by the bridge.

pub mod config;
pub mod lyric;
pub mod platform;
pub mod protocol;
