//! Petites briques partagées par les crates du player.

pub mod time;

pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
