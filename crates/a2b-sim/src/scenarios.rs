use std::collections::BTreeMap;

use a2b_core::{A2bError, NodeAddr};
use a2b_stack::StackConfig;

/// Vendor id the scripted slave plugin binds to.
pub const SLAVE_VENDOR_ID: u8 = 0x41;

/// Scripted behaviour of one slave node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeScript {
    pub init: Result<(), A2bError>,
    pub deinit: Result<(), A2bError>,
    /// Ticks before a peripheral request is answered; 0 answers inline.
    pub latency_ticks: u32,
    /// Answer peripheral requests with a status word no facility produces.
    pub malformed: bool,
}

impl Default for NodeScript {
    fn default() -> Self {
        Self {
            init: Ok(()),
            deinit: Ok(()),
            latency_ticks: 0,
            malformed: false,
        }
    }
}

impl NodeScript {
    pub fn failing_init(err: A2bError) -> Self {
        Self {
            init: Err(err),
            ..Self::default()
        }
    }

    pub fn failing_deinit(err: A2bError) -> Self {
        Self {
            deinit: Err(err),
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, ticks: u32) -> Self {
        self.latency_ticks = ticks;
        self
    }

    pub fn malformed(mut self) -> Self {
        self.malformed = true;
        self
    }
}

/// A bus layout: which slave addresses answer discovery and how.
#[derive(Debug, Clone)]
pub struct BusScenario {
    pub stack: StackConfig,
    pub nodes: BTreeMap<NodeAddr, NodeScript>,
}

impl BusScenario {
    pub fn new(stack: StackConfig) -> Self {
        Self {
            stack,
            nodes: BTreeMap::new(),
        }
    }

    /// `count` well-behaved slaves at addresses `0..count`.
    pub fn healthy_chain(count: u8) -> Self {
        let stack = StackConfig {
            max_slaves: count.max(1),
            ..StackConfig::default()
        };
        let mut scenario = Self::new(stack);
        for addr in 0..i16::from(count) {
            scenario.nodes.insert(NodeAddr(addr), NodeScript::default());
        }
        scenario
    }

    pub fn with_node(mut self, node: NodeAddr, script: NodeScript) -> Self {
        self.nodes.insert(node, script);
        self
    }

    pub fn without_node(mut self, node: NodeAddr) -> Self {
        self.nodes.remove(&node);
        self
    }

    pub fn script(&self, node: NodeAddr) -> Option<&NodeScript> {
        self.nodes.get(&node)
    }

    /// Full slave address range of the configured bus.
    pub fn slave_range(&self) -> (NodeAddr, NodeAddr) {
        (NodeAddr(0), NodeAddr(i16::from(self.stack.max_slaves) - 1))
    }
}
