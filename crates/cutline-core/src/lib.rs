// crates/cutline-core/src/lib.rs

pub mod admission;
pub mod cancel;
pub mod coalesce;
pub mod config;
pub mod cursor;
pub mod error;
pub mod landing;
pub mod media_types;
pub mod predictor;
pub mod helpers;
