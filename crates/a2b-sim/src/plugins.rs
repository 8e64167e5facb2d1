use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use a2b_core::{A2bError, Facility, NodeAddr, NodeSignature, ResultCode};
use a2b_stack::commands::{request, Body, DiscoveredCount, StatusReply, VersionReply};
use a2b_stack::{Action, ContextId, MessageRef, Plugin, PluginHandle, Stack};
use tracing::{trace, warn};

use crate::scenarios::{NodeScript, SLAVE_VENDOR_ID};

/// Status word outside every facility's range; decodes as malformed.
pub const MALFORMED_STATUS: ResultCode = ResultCode(0x7F00_0000);

pub const SIM_VERSION: VersionReply = VersionReply {
    major: 0,
    minor: 1,
    build: 7,
};

/// A peripheral reply held back until its latency elapses.
pub(crate) struct PendingReply {
    pub node: NodeAddr,
    pub message: MessageRef,
    pub status: ResultCode,
    pub remaining: u32,
}

/// Shared record of what the simulated nodes saw.
#[derive(Default)]
pub(crate) struct BusLog {
    pub executions: BTreeMap<NodeAddr, u32>,
    pub pending: Vec<PendingReply>,
    pub interrupts: Vec<(NodeAddr, u8, u8)>,
}

fn reply<B: Body>(message: &MessageRef, body: &B) {
    if let Err(err) = message.write_body(body) {
        warn!(cmd = message.cmd(), %err, "reply does not fit payload");
    }
}

fn unsupported(message: &MessageRef) -> Action {
    let status = A2bError::InvalidParameter("unsupported command").code(Facility::Plugin);
    reply(message, &StatusReply { status });
    Action::Complete
}

/// Plugin bound to the Master node.
pub struct ScriptedMaster {
    discovered: Rc<Cell<u8>>,
}

impl ScriptedMaster {
    pub fn new(discovered: Rc<Cell<u8>>) -> Self {
        Self { discovered }
    }
}

struct MasterHandle {
    discovered: Rc<Cell<u8>>,
}

impl Plugin for ScriptedMaster {
    fn name(&self) -> &str {
        "sim-master"
    }

    fn open(&self, _: ContextId, signature: &NodeSignature) -> Option<Box<dyn PluginHandle>> {
        if !signature.node_addr.is_master() {
            return None;
        }
        Some(Box::new(MasterHandle {
            discovered: Rc::clone(&self.discovered),
        }))
    }
}

impl PluginHandle for MasterHandle {
    fn execute(&mut self, _: &mut Stack, _: ContextId, message: &MessageRef) -> Action {
        match message.cmd() {
            request::GET_NUM_DISCOVERED => {
                reply(
                    message,
                    &DiscoveredCount {
                        count: self.discovered.get(),
                    },
                );
                Action::Complete
            }
            request::PLUGIN_VERSION => {
                reply(message, &SIM_VERSION);
                Action::Complete
            }
            _ => unsupported(message),
        }
    }
}

/// Plugin bound to scripted slave nodes.
pub struct ScriptedSlave {
    scripts: BTreeMap<NodeAddr, NodeScript>,
    log: Rc<RefCell<BusLog>>,
}

impl ScriptedSlave {
    pub(crate) fn new(scripts: BTreeMap<NodeAddr, NodeScript>, log: Rc<RefCell<BusLog>>) -> Self {
        Self { scripts, log }
    }
}

struct SlaveHandle {
    node: NodeAddr,
    script: NodeScript,
    log: Rc<RefCell<BusLog>>,
}

impl Plugin for ScriptedSlave {
    fn name(&self) -> &str {
        "sim-slave"
    }

    fn open(&self, _: ContextId, signature: &NodeSignature) -> Option<Box<dyn PluginHandle>> {
        if signature.vendor_id != SLAVE_VENDOR_ID {
            return None;
        }
        let script = *self.scripts.get(&signature.node_addr)?;
        Some(Box::new(SlaveHandle {
            node: signature.node_addr,
            script,
            log: Rc::clone(&self.log),
        }))
    }
}

impl PluginHandle for SlaveHandle {
    fn execute(&mut self, _: &mut Stack, _: ContextId, message: &MessageRef) -> Action {
        let mut log = self.log.borrow_mut();
        *log.executions.entry(self.node).or_default() += 1;

        let result = match message.cmd() {
            request::PERIPH_INIT => self.script.init,
            request::PERIPH_DEINIT => self.script.deinit,
            request::PLUGIN_VERSION => {
                reply(message, &SIM_VERSION);
                return Action::Complete;
            }
            _ => return unsupported(message),
        };
        let status = if self.script.malformed {
            MALFORMED_STATUS
        } else {
            ResultCode::from_result(result, Facility::Plugin)
        };

        if self.script.latency_ticks == 0 {
            reply(message, &StatusReply { status });
            return Action::Complete;
        }
        trace!(node = %self.node, ticks = self.script.latency_ticks, "reply deferred");
        log.pending.push(PendingReply {
            node: self.node,
            message: message.clone(),
            status,
            remaining: self.script.latency_ticks,
        });
        Action::Suspend
    }

    fn interrupt(&mut self, _: &mut Stack, _: ContextId, source_mask: u8, type_mask: u8) {
        self.log
            .borrow_mut()
            .interrupts
            .push((self.node, source_mask, type_mask));
    }

    fn close(&mut self) {
        let node = self.node;
        self.log.borrow_mut().pending.retain(|p| p.node != node);
    }
}
