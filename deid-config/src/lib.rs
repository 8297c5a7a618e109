//! Configuration loading and typed configuration sections for the de-identification pipeline.

mod environment;
mod load;
pub mod shared;

pub use environment::*;
pub use load::*;
