//! Turn-based elimination game ("russian roulette") synchronized with the
//! mixer's sound cues. [`state`] is the pure rules engine; [`roulette`] binds
//! it to Discord: timers, status embeds, punishments, voice teardown.

pub mod roulette;
pub mod state;
