use std::fmt;

use serde::{Deserialize, Serialize};

/// Bus node address. Slaves count up from 0; the Master is `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddr(pub i16);

/// Address of the Master node.
pub const MASTER_NODE: NodeAddr = NodeAddr(-1);

impl NodeAddr {
    pub fn is_master(self) -> bool {
        self == MASTER_NODE
    }

    /// Slot of this node in an address-indexed table (Master is slot 0).
    pub fn slot(self) -> Option<usize> {
        usize::try_from(i32::from(self.0) + 1).ok()
    }

    /// Node address stored at table slot `slot`.
    pub fn from_slot(slot: usize) -> Option<Self> {
        let raw = i16::try_from(slot).ok()?;
        Some(Self(raw - 1))
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_master() {
            f.write_str("master")
        } else {
            write!(f, "node{}", self.0)
        }
    }
}

/// Identity of a discovered node, handed to plugins during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSignature {
    pub node_addr: NodeAddr,
    pub vendor_id: u8,
    pub product_id: u8,
    pub version: u8,
}

impl NodeSignature {
    pub fn new(node_addr: NodeAddr, vendor_id: u8, product_id: u8, version: u8) -> Self {
        Self {
            node_addr,
            vendor_id,
            product_id,
            version,
        }
    }
}

impl Default for NodeSignature {
    fn default() -> Self {
        Self::new(MASTER_NODE, 0xAD, 0x10, 0x01)
    }
}
