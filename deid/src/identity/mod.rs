//! Identity resolution: from raw records to one stable pseudonym per entity.
//!
//! ```text
//!  raw records ──► IdentityMapStage ──► group_partials ──► IdentityResolutionStage
//!                                                               │
//!                  IdentitySnapshot ◄── generation files ◄──────┘
//!                         │
//!  raw records ──► IdentityScrubbingStage ──► scrubbed records
//! ```

mod catalog;
pub mod codec;
mod generation;
mod map;
mod policy;
mod record;
mod resolve;
mod scrub;
mod snapshot;

pub use catalog::{IdentifierCatalog, IdentifierKind, IdentifierType};
pub use generation::{
    GenerationWriter, SUCCESS_MARKER, SnapshotGeneration, SnapshotGenerations, next_generation,
};
pub use map::{GroupingKey, IdentityMapStage, group_partials};
pub use policy::{IdentifierColumn, TableIdentityPolicy};
pub use record::{IdentifierValue, IdentityRecord, SetOutcome};
pub use resolve::{
    IdentityResolutionStage, MergePolicy, PseudonymGenerator, PseudonymOrigin, Resolution,
    UuidPseudonymGenerator,
};
pub use scrub::{
    IdentityScrubbingStage, ScrubCounts, ScrubOutcome, ScrubbedShard, UnresolvedIdentityPolicy,
};
pub use snapshot::{FileSnapshotSource, IdentitySnapshot, MemorySnapshotSource, SnapshotSource};
