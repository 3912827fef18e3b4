//! Bridge between a polled music player and an AMLL lyric display.

pub mod control;
pub mod error;
pub mod fetch;
pub mod lyrics;
pub mod playback;
pub mod supervisor;
