//! Range Deletion Integration Tests
//!
//! The durable deletion queue and its processor, plus manual orphan
//! cleanup, on nodes holding documents they do not own.

#[path = "../common/mod.rs"]
mod common;

mod orphan_cleanup;
mod processor;
