use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use a2b_core::{A2bError, Facility, NodeAddr, NodeSignature, ResultCode};
use a2b_stack::commands::{notify, request, DiscoveredCount, NodeDiscoveredBody, StatusReply};
use a2b_stack::{
    Action, ContextId, Message, MessageType, PeriphOp, Plugin, Stack, MASTER_NODE,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::plugins::{BusLog, ScriptedMaster, ScriptedSlave};
use crate::scenarios::{BusScenario, SLAVE_VENDOR_ID};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeExecutions {
    pub node: i16,
    pub count: u32,
}

/// Outcome of one peripheral operation on the simulated bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub op: String,
    pub finished: bool,
    /// Packed result; meaningful only when `finished`.
    pub result_code: u32,
    pub ticks: u64,
    pub discovered: Vec<i16>,
    pub executions: Vec<NodeExecutions>,
}

impl RunReport {
    pub fn result(&self) -> Option<Result<(), A2bError>> {
        if !self.finished {
            return None;
        }
        ResultCode(self.result_code).into_result()
    }

    pub fn succeeded(&self) -> bool {
        self.result() == Some(Ok(()))
    }

    pub fn executions_of(&self, node: NodeAddr) -> u32 {
        self.executions
            .iter()
            .find(|e| e.node == node.0)
            .map_or(0, |e| e.count)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match self.result() {
            None => "timed out".to_owned(),
            Some(Ok(())) => "ok".to_owned(),
            Some(Err(err)) => err.to_string(),
        };
        write!(
            f,
            "{} over {} nodes: {} after {} ticks",
            self.op,
            self.discovered.len(),
            outcome,
            self.ticks
        )
    }
}

/// Stack wired to scripted plugins for every node of a [`BusScenario`].
pub struct SimBus {
    stack: Stack,
    scenario: BusScenario,
    log: Rc<RefCell<BusLog>>,
    discovered: Rc<Cell<u8>>,
    announced: Rc<RefCell<Vec<NodeAddr>>>,
}

impl SimBus {
    pub fn new(scenario: BusScenario) -> Result<Self, A2bError> {
        let log = Rc::new(RefCell::new(BusLog::default()));
        let discovered = Rc::new(Cell::new(0));
        let plugins: Vec<Rc<dyn Plugin>> = vec![
            Rc::new(ScriptedMaster::new(Rc::clone(&discovered))),
            Rc::new(ScriptedSlave::new(scenario.nodes.clone(), Rc::clone(&log))),
        ];
        let mut stack = Stack::new(scenario.stack.clone(), plugins)?;

        let announced = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&announced);
        stack.register_notifier(
            ContextId::Application,
            notify::NODE_DISCOVERED,
            Box::new(move |_, msg| {
                if let Some(body) = msg.read_body::<NodeDiscoveredBody>() {
                    sink.borrow_mut().push(body.signature.node_addr);
                }
            }),
            None,
        )?;

        Ok(Self {
            stack,
            scenario,
            log,
            discovered,
            announced,
        })
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut Stack {
        &mut self.stack
    }

    pub fn scenario(&self) -> &BusScenario {
        &self.scenario
    }

    /// Nodes announced through `NODE_DISCOVERED`, in discovery order.
    pub fn announced(&self) -> Vec<NodeAddr> {
        self.announced.borrow().clone()
    }

    pub fn interrupts(&self) -> Vec<(NodeAddr, u8, u8)> {
        self.log.borrow().interrupts.clone()
    }

    /// Walks the slave range, binding a plugin for every node that answers.
    pub fn discover(&mut self) -> Result<Vec<NodeAddr>, A2bError> {
        let (first, last) = self.scenario.slave_range();
        let mut bound = Vec::new();
        let mut node = first;
        while node <= last {
            if self.scenario.script(node).is_some() {
                let signature = NodeSignature::new(node, SLAVE_VENDOR_ID, 0x01, 0x01);
                match self.stack.find_handler(ContextId::Application, signature) {
                    Ok(_) => {
                        bound.push(node);
                        self.discovered.set(self.discovered.get().saturating_add(1));
                        self.announce(signature)?;
                    }
                    Err(A2bError::ResourceUnavailable) => {
                        debug!(%node, "no plugin for node");
                    }
                    Err(err) => return Err(err),
                }
            }
            node = node.next();
        }
        info!(nodes = bound.len(), "discovery finished");
        Ok(bound)
    }

    fn announce(&mut self, signature: NodeSignature) -> Result<(), A2bError> {
        let msg = Message::alloc(
            &self.stack,
            ContextId::Application,
            MessageType::Notify,
            notify::NODE_DISCOVERED,
        )?;
        msg.write_body(&NodeDiscoveredBody { signature })?;
        self.stack.notify(&msg)?;
        Ok(())
    }

    /// Asks the Master how many nodes it has seen.
    pub fn query_discovered(&mut self, max_ticks: u64) -> Result<u8, A2bError> {
        let msg = Message::alloc(
            &self.stack,
            ContextId::Application,
            MessageType::Request,
            request::GET_NUM_DISCOVERED,
        )?;
        let done = Rc::new(Cell::new(false));
        let flag = Rc::clone(&done);
        self.stack.send_request(
            &msg,
            MASTER_NODE,
            Some(Box::new(move |_, _, cancelled| flag.set(!cancelled))),
        )?;
        for _ in 0..max_ticks {
            if done.get() {
                break;
            }
            self.step();
        }
        if !done.get() {
            return Err(A2bError::ResourceUnavailable);
        }
        msg.read_body::<DiscoveredCount>()
            .map(|body| body.count)
            .ok_or(A2bError::Internal("empty discovered-count reply"))
    }

    /// Runs `op` across the slave range until it finishes or `max_ticks`
    /// elapse.
    pub fn run_op(&mut self, op: PeriphOp, max_ticks: u64) -> Result<RunReport, A2bError> {
        self.run_op_paced(op, max_ticks, |_| {})
    }

    /// Like [`SimBus::run_op`], calling `pace` with the tick count after
    /// every step.
    pub fn run_op_paced(
        &mut self,
        op: PeriphOp,
        max_ticks: u64,
        mut pace: impl FnMut(u64),
    ) -> Result<RunReport, A2bError> {
        self.log.borrow_mut().executions.clear();
        let (first, last) = self.scenario.slave_range();
        let outcome = Rc::new(Cell::new(None));
        let sink = Rc::clone(&outcome);
        self.stack.periph_exec_op(
            op,
            first,
            last,
            Box::new(move |_, result| sink.set(Some(result))),
        )?;

        let mut ticks = 0;
        while outcome.get().is_none() && ticks < max_ticks {
            self.step();
            ticks += 1;
            pace(ticks);
        }
        let result = outcome.get();
        if result.is_none() {
            warn!(?op, ticks, "peripheral operation did not finish");
        }

        let log = self.log.borrow();
        Ok(RunReport {
            op: format!("{op:?}").to_lowercase(),
            finished: result.is_some(),
            result_code: result
                .map_or(0, |r| ResultCode::from_result(r, Facility::Sequencer).0),
            ticks,
            discovered: self
                .stack
                .plugin_nodes()
                .into_iter()
                .filter(|n| !n.is_master())
                .map(|n| n.0)
                .collect(),
            executions: log
                .executions
                .iter()
                .map(|(node, count)| NodeExecutions {
                    node: node.0,
                    count: *count,
                })
                .collect(),
        })
    }

    /// One stack tick followed by any replies whose latency elapsed.
    pub fn step(&mut self) -> usize {
        let executed = self.stack.tick();
        self.release_due_replies();
        executed
    }

    fn release_due_replies(&mut self) {
        let due = {
            let mut log = self.log.borrow_mut();
            let (due, mut waiting): (Vec<_>, Vec<_>) =
                log.pending.drain(..).partition(|p| p.remaining == 0);
            for pending in &mut waiting {
                pending.remaining -= 1;
            }
            log.pending = waiting;
            due
        };
        for reply in due {
            let status = StatusReply {
                status: reply.status,
            };
            if let Err(err) = reply.message.write_body(&status) {
                warn!(node = %reply.node, %err, "deferred reply does not fit payload");
            }
            let Some(mailbox) = self.stack.default_mailbox(reply.node) else {
                continue;
            };
            let context = ContextId::Plugin(reply.node);
            if let Err(err) = self.stack.exec_update(context, mailbox, Action::Complete) {
                warn!(node = %reply.node, %err, "failed to complete deferred reply");
            }
        }
    }
}

impl fmt::Debug for SimBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimBus")
            .field("stack", &self.stack)
            .field("nodes", &self.scenario.nodes.len())
            .finish()
    }
}
