//! Session-local node handles.
//!
//! A [`NodeId`] names a slot in the host's node storage plus the generation
//! that slot had when the node was created. Destroying a node bumps the slot's
//! generation, so old handles stop resolving. Handles never survive a
//! restart; cross-session identity lives in [`crate::identity`].

use std::fmt;

/// Handle to a live scene node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    slot: u32,
    generation: u32,
}

impl NodeId {
    pub(crate) fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    pub fn slot(self) -> u32 {
        self.slot
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node#{}@{}", self.slot, self.generation)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.slot, self.generation)
    }
}
