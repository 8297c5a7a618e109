pub mod error;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod identity;
pub mod lease;
mod macros;
pub mod metrics;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
