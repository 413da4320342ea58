//! Internal utilities.

mod rng;

pub use rng::SplitMix;
