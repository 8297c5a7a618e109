//! Helpers for tests of the de-identification core.
//!
//! - [`failpoints`] configures fault injection points, with the `failpoints` feature.
//! - [`clock`] provides a controllable [`crate::lease::Clock`].
//! - [`lease_store`] wraps a lease store to inject failures and foreign writes.
//! - [`pseudonym`] mints predictable pseudonyms.
//! - [`records`] builds raw records and identity records for fixtures.

pub mod clock;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod lease_store;
pub mod pseudonym;
pub mod records;
