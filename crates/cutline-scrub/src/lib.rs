// crates/cutline-scrub/src/lib.rs

pub mod display;
pub mod pipeline;
pub mod worker;

pub use display::{CacheSurface, DisplaySurface};
pub use pipeline::ScrubPipeline;
