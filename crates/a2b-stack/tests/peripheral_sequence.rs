use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use a2b_core::{Facility, ResultCode};
use a2b_stack::commands::StatusReply;
use a2b_stack::{
    A2bError, Action, ContextId, MessageRef, NodeAddr, NodeSignature, PeriphOp, Plugin,
    PluginHandle, Stack, StackConfig, MASTER_NODE,
};

const SLAVE_VENDOR: u8 = 0x11;

#[derive(Clone, Copy)]
enum Reply {
    Status(Result<(), A2bError>),
    Garbage,
    Park,
}

#[derive(Default)]
struct Bus {
    replies: HashMap<i16, Reply>,
    visits: Vec<(NodeAddr, u32)>,
}

struct MasterPlugin;

struct MasterHandle;

impl Plugin for MasterPlugin {
    fn name(&self) -> &str {
        "master"
    }

    fn open(&self, _: ContextId, sig: &NodeSignature) -> Option<Box<dyn PluginHandle>> {
        sig.node_addr
            .is_master()
            .then(|| Box::new(MasterHandle) as Box<dyn PluginHandle>)
    }
}

impl PluginHandle for MasterHandle {
    fn execute(&mut self, _: &mut Stack, _: ContextId, _: &MessageRef) -> Action {
        Action::Complete
    }
}

struct SlavePlugin {
    bus: Rc<RefCell<Bus>>,
}

struct SlaveHandle {
    node: NodeAddr,
    bus: Rc<RefCell<Bus>>,
}

impl Plugin for SlavePlugin {
    fn name(&self) -> &str {
        "slave"
    }

    fn open(&self, _: ContextId, sig: &NodeSignature) -> Option<Box<dyn PluginHandle>> {
        (sig.vendor_id == SLAVE_VENDOR).then(|| {
            Box::new(SlaveHandle {
                node: sig.node_addr,
                bus: Rc::clone(&self.bus),
            }) as Box<dyn PluginHandle>
        })
    }
}

impl PluginHandle for SlaveHandle {
    fn execute(&mut self, _: &mut Stack, _: ContextId, message: &MessageRef) -> Action {
        let mut bus = self.bus.borrow_mut();
        bus.visits.push((self.node, message.cmd()));
        let reply = bus
            .replies
            .get(&self.node.0)
            .copied()
            .unwrap_or(Reply::Status(Ok(())));
        let status = match reply {
            Reply::Status(result) => ResultCode::from_result(result, Facility::Plugin),
            Reply::Garbage => ResultCode(0x7F00_0000),
            Reply::Park => return Action::Suspend,
        };
        message
            .write_body(&StatusReply { status })
            .expect("status fits payload");
        Action::Complete
    }
}

struct Harness {
    stack: Stack,
    bus: Rc<RefCell<Bus>>,
    outcome: Rc<RefCell<Option<Result<(), A2bError>>>>,
}

impl Harness {
    fn new(slaves: &[i16]) -> Self {
        let bus = Rc::new(RefCell::new(Bus::default()));
        let cfg = StackConfig {
            max_slaves: 8,
            ..StackConfig::default()
        };
        let mut stack = Stack::new(
            cfg,
            vec![
                Rc::new(MasterPlugin) as Rc<dyn Plugin>,
                Rc::new(SlavePlugin {
                    bus: Rc::clone(&bus),
                }),
            ],
        )
        .expect("stack");
        for &node in slaves {
            stack
                .find_handler(
                    ContextId::Application,
                    NodeSignature::new(NodeAddr(node), SLAVE_VENDOR, 1, 1),
                )
                .expect("bind slave");
        }
        Self {
            stack,
            bus,
            outcome: Rc::new(RefCell::new(None)),
        }
    }

    fn reply(&self, node: i16, reply: Reply) {
        self.bus.borrow_mut().replies.insert(node, reply);
    }

    fn start(&mut self, op: PeriphOp, from: i16, to: i16) -> Result<(), A2bError> {
        let outcome = Rc::clone(&self.outcome);
        self.stack.periph_exec_op(
            op,
            NodeAddr(from),
            NodeAddr(to),
            Box::new(move |_, result| {
                assert!(outcome.borrow_mut().replace(result).is_none());
            }),
        )
    }

    fn run(&mut self, max_ticks: usize) -> Option<Result<(), A2bError>> {
        for _ in 0..max_ticks {
            if let Some(result) = *self.outcome.borrow() {
                return Some(result);
            }
            self.stack.tick();
        }
        *self.outcome.borrow()
    }

    fn visited(&self) -> Vec<i16> {
        self.bus.borrow().visits.iter().map(|(n, _)| n.0).collect()
    }
}

#[test]
fn init_skips_nodes_without_a_plugin() {
    let mut h = Harness::new(&[0, 1, 3]);
    h.start(PeriphOp::Init, 0, 3).expect("start");
    assert_eq!(h.run(64), Some(Ok(())));
    assert_eq!(h.visited(), vec![0, 1, 3]);
    assert!(!h.stack.sequence_active());
}

#[test]
fn init_stops_at_the_first_failing_node() {
    let mut h = Harness::new(&[0, 1, 2, 3]);
    h.reply(1, Reply::Status(Err(A2bError::ResourceUnavailable)));
    h.start(PeriphOp::Init, 0, 3).expect("start");
    assert_eq!(h.run(64), Some(Err(A2bError::ResourceUnavailable)));
    assert_eq!(h.visited(), vec![0, 1]);
}

#[test]
fn deinit_attempts_every_node_and_reports_the_failure() {
    let mut h = Harness::new(&[0, 1, 2]);
    h.reply(1, Reply::Status(Err(A2bError::DoesNotExist)));
    h.start(PeriphOp::Deinit, 0, 2).expect("start");
    assert_eq!(h.run(64), Some(Err(A2bError::DoesNotExist)));
    assert_eq!(h.visited(), vec![0, 1, 2]);
    assert!(h
        .bus
        .borrow()
        .visits
        .iter()
        .all(|(_, cmd)| *cmd == PeriphOp::Deinit.command()));
}

#[test]
fn reversed_range_fails_without_bus_traffic() {
    let mut h = Harness::new(&[0, 1]);
    let live = h.stack.heap().live_allocations();
    let err = h.start(PeriphOp::Init, 2, 1).unwrap_err();
    assert!(matches!(err, A2bError::InvalidParameter(_)));
    assert_eq!(h.run(9), None);
    assert!(h.visited().is_empty());
    assert_eq!(h.stack.heap().live_allocations(), live);
}

#[test]
fn empty_range_finishes_without_waiting_for_a_tick() {
    let mut h = Harness::new(&[]);
    h.start(PeriphOp::Deinit, 0, 4).expect("start");
    assert_eq!(*h.outcome.borrow(), Some(Ok(())));
    assert_eq!(h.stack.ticks(), 0);
}

#[test]
fn malformed_reply_ends_the_sequence() {
    let mut h = Harness::new(&[0, 1]);
    h.reply(0, Reply::Garbage);
    h.start(PeriphOp::Deinit, 0, 1).expect("start");
    assert_eq!(h.run(64), Some(Err(A2bError::ResourceUnavailable)));
    assert_eq!(h.visited(), vec![0]);
}

#[test]
fn only_one_sequence_runs_at_a_time() {
    let mut h = Harness::new(&[0]);
    h.reply(0, Reply::Park);
    h.start(PeriphOp::Init, 0, 0).expect("start");
    assert_eq!(
        h.start(PeriphOp::Deinit, 0, 0).unwrap_err(),
        A2bError::ResourceUnavailable
    );
    assert!(h.stack.sequence_active());
}

#[test]
fn parked_reply_resumes_via_exec_update() {
    let mut h = Harness::new(&[0, 1]);
    h.reply(0, Reply::Park);
    h.start(PeriphOp::Init, 0, 1).expect("start");
    assert_eq!(h.run(18), None);
    assert_eq!(h.visited(), vec![0]);

    let ctx = ContextId::Plugin(NodeAddr(0));
    let mailbox = h.stack.default_mailbox(NodeAddr(0)).expect("mailbox");
    let parked = h
        .stack
        .get_executing_message(ctx, mailbox)
        .expect("lookup")
        .expect("parked request");
    parked
        .write_body(&StatusReply {
            status: ResultCode::SUCCESS,
        })
        .expect("write");
    drop(parked);
    h.stack
        .exec_update(ctx, mailbox, Action::Complete)
        .expect("update");

    assert_eq!(h.run(64), Some(Ok(())));
    assert_eq!(h.visited(), vec![0, 1]);
}

#[test]
fn freeing_the_replying_node_cancels_the_sequence() {
    let mut h = Harness::new(&[0, 1]);
    h.reply(0, Reply::Park);
    h.start(PeriphOp::Deinit, 0, 1).expect("start");
    h.run(9);
    h.stack
        .context_free(ContextId::Plugin(NodeAddr(0)))
        .expect("free");
    assert_eq!(*h.outcome.borrow(), Some(Err(A2bError::Cancelled)));
    assert!(!h.stack.sequence_active());
}

#[test]
fn freeing_the_master_cancels_the_sequence() {
    let mut h = Harness::new(&[0]);
    h.reply(0, Reply::Park);
    h.start(PeriphOp::Init, 0, 0).expect("start");
    h.stack.context_free(ContextId::Plugin(MASTER_NODE)).expect("free");
    assert_eq!(*h.outcome.borrow(), Some(Err(A2bError::Cancelled)));

    // The orphaned request is flushed at teardown without a second callback.
    let Harness { stack, outcome, .. } = h;
    drop(stack);
    assert_eq!(*outcome.borrow(), Some(Err(A2bError::Cancelled)));
}

#[test]
fn exhausted_heap_ends_the_sequence_with_alloc_failure() {
    let mut h = Harness::new(&[0, 1, 2]);
    h.stack.context_find(MASTER_NODE).expect("master");
    let live = h.stack.heap().live_allocations();

    h.start(PeriphOp::Deinit, 0, 2).expect("start");
    assert!(h.stack.sequence_active());
    let heap = Rc::clone(h.stack.heap());
    heap.set_limit(Some(heap.in_use()));

    assert_eq!(h.run(64), Some(Err(A2bError::AllocFailure)));
    assert_eq!(h.visited(), vec![0]);
    assert!(!h.stack.sequence_active());
    assert_eq!(heap.live_allocations(), live);

    heap.set_limit(None);
    h.outcome.borrow_mut().take();
    h.start(PeriphOp::Deinit, 1, 2).expect("restart");
    assert_eq!(h.run(64), Some(Ok(())));
    assert_eq!(h.visited(), vec![0, 1, 2]);
}
