//! Migration Integration Tests
//!
//! End-to-end chunk moves between two in-process nodes sharing a catalog
//! and a cluster directory.

#[path = "../common/mod.rs"]
mod common;

mod critical_section;
mod deleter_switch;
mod partition;
mod write_path;
