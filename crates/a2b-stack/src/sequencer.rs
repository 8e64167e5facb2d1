//! Peripheral sequencer.
//!
//! Walks an inclusive node range on behalf of the Master context, sending
//! one init or deinit request at a time and folding every reply into a
//! single result. [`PeriphSequencer`] is the pure state machine; the
//! driver on [`Stack`] turns its steps into routed requests and feeds
//! send outcomes and replies back as [`SequenceEvent`]s.

use a2b_core::{A2bError, NodeAddr, MASTER_NODE};
use tracing::{debug, info, trace};

use crate::commands::{request, StatusReply};
use crate::context::ContextId;
use crate::message::{Message, MessageRef, MessageType};
use crate::stack::Stack;

/// Ranged peripheral operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriphOp {
    /// Fail-fast: the first node failure ends the sequence.
    Init,
    /// Best-effort: every node is attempted, the last failure is reported.
    Deinit,
}

impl PeriphOp {
    pub fn command(self) -> u32 {
        match self {
            Self::Init => request::PERIPH_INIT,
            Self::Deinit => request::PERIPH_DEINIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceEvent {
    /// The request to the current node was queued.
    SendAccepted,
    /// The request could not be routed. `DoesNotExist` and
    /// `ResourceUnavailable` mean the node has no plugin and are skipped.
    SendFailed(A2bError),
    /// The in-flight request was flushed before it completed.
    Cancelled,
    /// The reply body did not decode to a status.
    Malformed,
    Replied(Result<(), A2bError>),
}

/// What the driver must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStep {
    Send(NodeAddr),
    Await,
    Finish(Result<(), A2bError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Sending,
    Awaiting,
    Done,
}

#[derive(Debug, Clone)]
pub struct PeriphSequencer {
    op: PeriphOp,
    current: NodeAddr,
    last: NodeAddr,
    last_error: Result<(), A2bError>,
    phase: Phase,
}

impl PeriphSequencer {
    /// Seeds a sequence over `start..=end` and returns its first step.
    pub fn start(
        op: PeriphOp,
        start: NodeAddr,
        end: NodeAddr,
    ) -> Result<(Self, SequenceStep), A2bError> {
        if start > end {
            return Err(A2bError::InvalidParameter("start node after end node"));
        }
        let machine = Self {
            op,
            current: start,
            last: end,
            last_error: Ok(()),
            phase: Phase::Sending,
        };
        Ok((machine, SequenceStep::Send(start)))
    }

    pub fn op(&self) -> PeriphOp {
        self.op
    }

    pub fn current(&self) -> NodeAddr {
        self.current
    }

    pub fn last_error(&self) -> Result<(), A2bError> {
        self.last_error
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn handle(&mut self, event: SequenceEvent) -> SequenceStep {
        if self.phase == Phase::Done {
            return SequenceStep::Finish(Err(A2bError::Internal("sequence already finished")));
        }
        match event {
            SequenceEvent::SendAccepted => {
                self.phase = Phase::Awaiting;
                SequenceStep::Await
            }
            SequenceEvent::SendFailed(err) if err.is_absent_node() => self.advance(),
            SequenceEvent::SendFailed(err) => {
                self.last_error = Err(err);
                match self.op {
                    PeriphOp::Init => self.finish(Err(err)),
                    PeriphOp::Deinit => self.advance(),
                }
            }
            SequenceEvent::Cancelled => self.finish(Err(A2bError::Cancelled)),
            SequenceEvent::Malformed => self.finish(Err(A2bError::ResourceUnavailable)),
            SequenceEvent::Replied(result) => match (self.op, result) {
                (PeriphOp::Init, Err(err)) => self.finish(Err(err)),
                (PeriphOp::Init, Ok(())) => {
                    self.last_error = Ok(());
                    self.advance()
                }
                (PeriphOp::Deinit, Err(err)) => {
                    self.last_error = Err(err);
                    self.advance()
                }
                (PeriphOp::Deinit, Ok(())) => self.advance(),
            },
        }
    }

    fn advance(&mut self) -> SequenceStep {
        if self.current >= self.last {
            return self.finish(self.last_error);
        }
        self.current = self.current.next();
        self.phase = Phase::Sending;
        SequenceStep::Send(self.current)
    }

    fn finish(&mut self, result: Result<(), A2bError>) -> SequenceStep {
        self.phase = Phase::Done;
        SequenceStep::Finish(result)
    }
}

/// Completion callback of a ranged operation.
pub type SequenceCallback = Box<dyn FnOnce(&mut Stack, Result<(), A2bError>)>;

/// Sequence state held by the Master context while an operation runs.
pub(crate) struct ActiveSequence {
    pub machine: PeriphSequencer,
    pub on_done: SequenceCallback,
    /// Request currently awaiting its reply.
    pub pending: Option<MessageRef>,
}

impl Stack {
    /// Runs `op` across `start..=end` from the Master context.
    ///
    /// `on_done` runs exactly once with the folded result, unless this call
    /// itself fails. Only one sequence may run per Master context.
    pub fn periph_exec_op(
        &mut self,
        op: PeriphOp,
        start: NodeAddr,
        end: NodeAddr,
        on_done: SequenceCallback,
    ) -> Result<(), A2bError> {
        let (machine, step) = PeriphSequencer::start(op, start, end)?;
        self.require_alive()?;
        if !self.node_in_range(start) || !self.node_in_range(end) {
            return Err(A2bError::InvalidParameter("node range out of bounds"));
        }
        self.context_find(MASTER_NODE)
            .ok_or(A2bError::ResourceUnavailable)?;
        let master = self
            .table
            .get_mut(MASTER_NODE)
            .ok_or(A2bError::Internal("master context vanished"))?;
        if master.sequence.is_some() {
            return Err(A2bError::ResourceUnavailable);
        }
        master.sequence = Some(ActiveSequence {
            machine,
            on_done,
            pending: None,
        });
        info!(?op, %start, %end, "peripheral sequence started");
        self.drive_sequence(step);
        Ok(())
    }

    /// Whether a peripheral sequence is in flight.
    pub fn sequence_active(&self) -> bool {
        self.table
            .get(MASTER_NODE)
            .is_some_and(|ctx| ctx.sequence.is_some())
    }

    fn drive_sequence(&mut self, mut step: SequenceStep) {
        loop {
            let node = match step {
                SequenceStep::Await => return,
                SequenceStep::Finish(result) => {
                    self.finish_sequence(result);
                    return;
                }
                SequenceStep::Send(node) => node,
            };
            let event = match self.send_sequence_request(node) {
                Ok(()) => SequenceEvent::SendAccepted,
                Err(A2bError::AllocFailure) => {
                    self.finish_sequence(Err(A2bError::AllocFailure));
                    return;
                }
                Err(err) => {
                    trace!(%node, %err, "sequence send failed");
                    SequenceEvent::SendFailed(err)
                }
            };
            let Some(next) = self.sequence_event(event) else {
                return;
            };
            step = next;
        }
    }

    fn send_sequence_request(&mut self, node: NodeAddr) -> Result<(), A2bError> {
        let op = self
            .active_sequence()
            .map(|active| active.machine.op())
            .ok_or(A2bError::Internal("no active sequence"))?;
        let message = Message::alloc(
            self,
            ContextId::Plugin(MASTER_NODE),
            MessageType::Request,
            op.command(),
        )?;
        self.send_request(
            &message,
            node,
            Some(Box::new(|stack, reply, cancelled| {
                stack.on_sequence_reply(reply, cancelled)
            })),
        )?;
        if let Some(active) = self.active_sequence() {
            active.pending = Some(message);
        }
        Ok(())
    }

    fn on_sequence_reply(&mut self, reply: &MessageRef, cancelled: bool) {
        let Some(active) = self.active_sequence() else {
            trace!(tid = reply.tid(), "reply with no sequence running");
            return;
        };
        if !active
            .pending
            .as_ref()
            .is_some_and(|pending| MessageRef::ptr_eq(pending, reply))
        {
            trace!(tid = reply.tid(), "stale sequence reply");
            return;
        }
        active.pending = None;

        let event = if cancelled {
            SequenceEvent::Cancelled
        } else if !reply.was_delivered() {
            SequenceEvent::SendFailed(A2bError::ResourceUnavailable)
        } else {
            match reply
                .read_body::<StatusReply>()
                .and_then(|body| body.status.into_result())
            {
                Some(result) => SequenceEvent::Replied(result),
                None => SequenceEvent::Malformed,
            }
        };
        let node = active.machine.current();
        debug!(%node, ?event, "sequence reply");
        let step = active.machine.handle(event);
        self.drive_sequence(step);
    }

    fn sequence_event(&mut self, event: SequenceEvent) -> Option<SequenceStep> {
        let active = self.active_sequence()?;
        Some(active.machine.handle(event))
    }

    fn finish_sequence(&mut self, result: Result<(), A2bError>) {
        let Some(active) = self
            .table
            .get_mut(MASTER_NODE)
            .and_then(|ctx| ctx.sequence.take())
        else {
            return;
        };
        info!(op = ?active.machine.op(), ?result, "peripheral sequence finished");
        (active.on_done)(self, result);
    }

    fn active_sequence(&mut self) -> Option<&mut ActiveSequence> {
        self.table.get_mut(MASTER_NODE)?.sequence.as_mut()
    }
}
