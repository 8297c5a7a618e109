mod base;
mod connection;
mod identity;
mod lease;
mod runner;
mod snapshot;
mod store;

pub use base::*;
pub use connection::*;
pub use identity::*;
pub use lease::*;
pub use runner::*;
pub use snapshot::*;
pub use store::*;
