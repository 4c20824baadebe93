//! Recovery Integration Tests
//!
//! Migrations interrupted at every step boundary converge to one decision
//! once recovery runs, whether by restart or on demand.

#[path = "../common/mod.rs"]
mod common;

mod authority;
mod checkpoints;
mod quarantine;
