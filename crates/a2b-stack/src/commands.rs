//! Command identifiers and the fixed-layout message bodies they carry.
//!
//! Each body encodes little-endian into the front of a message payload.
//! The payload capacity of every message is at least [`BODY_UNION_SIZE`].

use a2b_core::{NodeAddr, NodeSignature, ResultCode};

/// Request command ids.
pub mod request {
    pub const DISCOVER_NODES: u32 = 0;
    pub const GET_NUM_DISCOVERED: u32 = 1;
    pub const PERIPH_INIT: u32 = 2;
    pub const PERIPH_DEINIT: u32 = 3;
    pub const PLUGIN_VERSION: u32 = 4;
    /// One past the last standard request id.
    pub const MAX: u32 = 5;
    /// Floor of the application-defined request range.
    pub const CUSTOM: u32 = 0x1000;
}

/// Notification command ids.
pub mod notify {
    pub const POWER_FAULT: u32 = 0;
    pub const INTERRUPT: u32 = 1;
    pub const NODE_DISCOVERED: u32 = 2;
    pub const PERIPH_ERROR: u32 = 3;
    /// One past the last standard notification id.
    pub const MAX: u32 = 4;
    /// Floor of the application-defined notification range.
    pub const CUSTOM: u32 = 0x1000;
}

/// Fixed-layout message body.
pub trait Body: Sized {
    const SIZE: usize;

    fn encode(&self, out: &mut [u8]);
    fn decode(raw: &[u8]) -> Option<Self>;
}

/// Reply status written by a plugin handling a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReply {
    pub status: ResultCode,
}

impl Body for StatusReply {
    const SIZE: usize = 4;

    fn encode(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.status.0.to_le_bytes());
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        let bytes: [u8; 4] = raw.get(..4)?.try_into().ok()?;
        Some(Self {
            status: ResultCode(u32::from_le_bytes(bytes)),
        })
    }
}

/// Reply to [`request::PLUGIN_VERSION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionReply {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
}

impl Body for VersionReply {
    const SIZE: usize = 4;

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.major;
        out[1] = self.minor;
        out[2..4].copy_from_slice(&self.build.to_le_bytes());
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        let raw = raw.get(..4)?;
        Some(Self {
            major: raw[0],
            minor: raw[1],
            build: u16::from_le_bytes([raw[2], raw[3]]),
        })
    }
}

/// Reply to [`request::GET_NUM_DISCOVERED`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredCount {
    pub count: u8,
}

impl Body for DiscoveredCount {
    const SIZE: usize = 1;

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.count;
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        raw.first().map(|&count| Self { count })
    }
}

/// Body of [`notify::NODE_DISCOVERED`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeDiscoveredBody {
    pub signature: NodeSignature,
}

impl Body for NodeDiscoveredBody {
    const SIZE: usize = 5;

    fn encode(&self, out: &mut [u8]) {
        let sig = &self.signature;
        out[..2].copy_from_slice(&sig.node_addr.0.to_le_bytes());
        out[2] = sig.vendor_id;
        out[3] = sig.product_id;
        out[4] = sig.version;
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        let raw = raw.get(..5)?;
        Some(Self {
            signature: NodeSignature::new(
                NodeAddr(i16::from_le_bytes([raw[0], raw[1]])),
                raw[2],
                raw[3],
                raw[4],
            ),
        })
    }
}

/// Body of [`notify::INTERRUPT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptBody {
    pub node: NodeAddr,
    pub source_mask: u8,
    pub type_mask: u8,
}

impl Body for InterruptBody {
    const SIZE: usize = 4;

    fn encode(&self, out: &mut [u8]) {
        out[..2].copy_from_slice(&self.node.0.to_le_bytes());
        out[2] = self.source_mask;
        out[3] = self.type_mask;
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        let raw = raw.get(..4)?;
        Some(Self {
            node: NodeAddr(i16::from_le_bytes([raw[0], raw[1]])),
            source_mask: raw[2],
            type_mask: raw[3],
        })
    }
}

const fn max(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

/// Size of the largest known body.
pub const BODY_UNION_SIZE: usize = max(
    max(StatusReply::SIZE, VersionReply::SIZE),
    max(
        DiscoveredCount::SIZE,
        max(NodeDiscoveredBody::SIZE, InterruptBody::SIZE),
    ),
);
