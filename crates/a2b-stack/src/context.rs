use std::fmt;
use std::rc::Rc;

use a2b_core::{A2bError, NodeAddr, NodeSignature};

use crate::heap::HeapLease;
use crate::plugin::{BoundHandle, Plugin};
use crate::queue::MailboxId;
use crate::sequencer::ActiveSequence;

/// Which side of the stack a context represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Application,
    Plugin,
}

/// Handle naming a stack context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextId {
    Application,
    Plugin(NodeAddr),
}

impl ContextId {
    pub fn domain(self) -> Domain {
        match self {
            Self::Application => Domain::Application,
            Self::Plugin(_) => Domain::Plugin,
        }
    }

    pub fn node(self) -> Option<NodeAddr> {
        match self {
            Self::Application => None,
            Self::Plugin(node) => Some(node),
        }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application => f.write_str("app"),
            Self::Plugin(node) => write!(f, "plugin@{node}"),
        }
    }
}

/// Plugin vtable and open handle bound to a context after discovery.
pub(crate) struct Binding {
    pub plugin: Rc<dyn Plugin>,
    pub handle: Rc<BoundHandle>,
}

/// Per-node plugin context.
pub(crate) struct PluginContext {
    pub signature: NodeSignature,
    /// `None` while discovery is still probing plugins.
    pub binding: Option<Binding>,
    /// Owned mailboxes; the first is the default mailbox.
    pub mailboxes: Vec<MailboxId>,
    /// Peripheral sequence in flight (Master context only).
    pub sequence: Option<ActiveSequence>,
    _lease: HeapLease,
}

impl PluginContext {
    pub fn new(signature: NodeSignature, default_mailbox: MailboxId, lease: HeapLease) -> Self {
        Self {
            signature,
            binding: None,
            mailboxes: vec![default_mailbox],
            sequence: None,
            _lease: lease,
        }
    }

    pub fn default_mailbox(&self) -> Option<MailboxId> {
        self.mailboxes.first().copied()
    }

    pub fn owns(&self, mailbox: MailboxId) -> bool {
        self.mailboxes.contains(&mailbox)
    }

    pub fn plugin_name(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.plugin.name())
    }
}

/// Plugin contexts indexed by `node_addr + 1`; slot 0 is the Master.
pub(crate) struct PluginTable {
    slots: Vec<Option<PluginContext>>,
}

impl PluginTable {
    pub fn new(max_slaves: u8) -> Self {
        let mut slots = Vec::with_capacity(usize::from(max_slaves) + 1);
        slots.resize_with(usize::from(max_slaves) + 1, || None);
        Self { slots }
    }

    pub fn in_range(&self, node: NodeAddr) -> bool {
        node.slot().is_some_and(|slot| slot < self.slots.len())
    }

    pub fn get(&self, node: NodeAddr) -> Option<&PluginContext> {
        self.slots.get(node.slot()?)?.as_ref()
    }

    pub fn get_mut(&mut self, node: NodeAddr) -> Option<&mut PluginContext> {
        self.slots.get_mut(node.slot()?)?.as_mut()
    }

    pub fn contains(&self, node: NodeAddr) -> bool {
        self.get(node).is_some()
    }

    pub fn insert(&mut self, node: NodeAddr, ctx: PluginContext) -> Result<(), A2bError> {
        let slot = node
            .slot()
            .and_then(|slot| self.slots.get_mut(slot))
            .ok_or(A2bError::InvalidParameter("node address out of range"))?;
        if slot.is_some() {
            return Err(A2bError::ResourceUnavailable);
        }
        *slot = Some(ctx);
        Ok(())
    }

    pub fn remove(&mut self, node: NodeAddr) -> Option<PluginContext> {
        self.slots.get_mut(node.slot()?)?.take()
    }

    /// Node whose context owns `mailbox`, scanning in address order.
    pub fn owner_of(&self, mailbox: MailboxId) -> Option<NodeAddr> {
        self.iter()
            .find(|(_, ctx)| ctx.owns(mailbox))
            .map(|(node, _)| node)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeAddr, &PluginContext)> + '_ {
        self.slots.iter().enumerate().filter_map(|(slot, ctx)| {
            let ctx = ctx.as_ref()?;
            Some((NodeAddr::from_slot(slot)?, ctx))
        })
    }

    pub fn nodes(&self) -> Vec<NodeAddr> {
        self.iter().map(|(node, _)| node).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
