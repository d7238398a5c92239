//! Background loops: the once-a-day surprise playback, the daily quote, and
//! the scheduled-message dispatcher. All are plain polling tasks spawned once
//! from the ready handler.

pub mod prank;
pub mod quotes;
pub mod scheduler;
