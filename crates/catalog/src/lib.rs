//! Metadata authority for Ferry
//!
//! The authority is the durable source of truth for which node owns which
//! chunk of a partitioned collection. Nodes read routing tables from it and
//! commit ownership changes through one fenced, idempotent call.
//!
//! - `MetadataAuthority`: the seam every node talks to
//! - `RoutingTable` / `Chunk`: a collection's placement at one version
//! - `InMemoryCatalog`: in-process authority with fault injection

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod authority;
pub mod memory;
pub mod routing;

pub use authority::{EnsureOutcome, EnsureOwnership, MetadataAuthority};
pub use memory::InMemoryCatalog;
pub use routing::{Chunk, RoutingTable};
