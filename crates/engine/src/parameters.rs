//! Runtime node parameters
//!
//! Switches an operator can flip on a live node. They take effect
//! immediately and are not persisted: a restarted node starts from the
//! values in its config file.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// Live, node-local switches
#[derive(Debug, Default)]
pub struct NodeParameters {
    disable_resumable_range_deleter: AtomicBool,
}

impl NodeParameters {
    /// Create parameters with the given initial deleter switch
    pub fn new(disable_resumable_range_deleter: bool) -> Self {
        Self {
            disable_resumable_range_deleter: AtomicBool::new(disable_resumable_range_deleter),
        }
    }

    /// True when durable range deletion is switched off on this node
    pub fn disable_resumable_range_deleter(&self) -> bool {
        self.disable_resumable_range_deleter.load(Ordering::SeqCst)
    }

    /// Flip the durable range deletion switch
    pub fn set_disable_resumable_range_deleter(&self, disabled: bool) {
        let previous = self
            .disable_resumable_range_deleter
            .swap(disabled, Ordering::SeqCst);
        if previous != disabled {
            info!(
                target: "ferry::node",
                disabled,
                "Resumable range deleter switch changed"
            );
        }
    }
}
