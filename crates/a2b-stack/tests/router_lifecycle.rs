use std::cell::{Cell, RefCell};
use std::rc::Rc;

use a2b_core::{Facility, ResultCode};
use a2b_stack::commands::{notify, request, StatusReply};
use a2b_stack::{
    A2bError, Action, ContextId, Message, MessageRef, MessageType, NodeAddr, NodeSignature,
    Plugin, PluginHandle, Priority, Stack, StackConfig, MASTER_NODE,
};

#[derive(Default)]
struct Journal {
    executed: Vec<u32>,
    closed: Vec<NodeAddr>,
}

/// Suspends every request until the test completes it.
struct Parking {
    journal: Rc<RefCell<Journal>>,
}

struct ParkingHandle {
    node: NodeAddr,
    journal: Rc<RefCell<Journal>>,
}

impl Plugin for Parking {
    fn name(&self) -> &str {
        "parking"
    }

    fn open(&self, _: ContextId, sig: &NodeSignature) -> Option<Box<dyn PluginHandle>> {
        Some(Box::new(ParkingHandle {
            node: sig.node_addr,
            journal: Rc::clone(&self.journal),
        }))
    }
}

impl PluginHandle for ParkingHandle {
    fn execute(&mut self, _: &mut Stack, _: ContextId, message: &MessageRef) -> Action {
        self.journal.borrow_mut().executed.push(message.tid());
        Action::Suspend
    }

    fn close(&mut self) {
        self.journal.borrow_mut().closed.push(self.node);
    }
}

fn parking_stack() -> (Stack, Rc<RefCell<Journal>>) {
    let journal = Rc::new(RefCell::new(Journal::default()));
    let cfg = StackConfig {
        max_slaves: 8,
        ..StackConfig::default()
    };
    let stack = Stack::new(
        cfg,
        vec![Rc::new(Parking {
            journal: Rc::clone(&journal),
        })],
    )
    .expect("stack");
    (stack, journal)
}

fn request_msg(stack: &Stack, tid: u32) -> MessageRef {
    let msg = Message::alloc(
        stack,
        ContextId::Application,
        MessageType::Request,
        request::PERIPH_INIT,
    )
    .expect("alloc");
    msg.set_tid(tid);
    msg
}

#[test]
fn freeing_a_context_cancels_every_queued_job_once() {
    let (mut stack, journal) = parking_stack();
    stack.context_find(MASTER_NODE).expect("master");
    let baseline = stack.heap().in_use();
    let node = NodeAddr(2);
    let ctx = stack
        .find_handler(ContextId::Application, NodeSignature::new(node, 1, 1, 1))
        .expect("bind");

    let mut mailboxes = vec![stack.default_mailbox(node).expect("default mailbox")];
    for level in [0_u8, 2, 4] {
        mailboxes.push(
            stack
                .mailbox_alloc(ctx, Priority::new(level).expect("priority"))
                .expect("mailbox"),
        );
    }
    assert_eq!(stack.mailboxes(ctx).len(), 4);

    let cancelled = Rc::new(RefCell::new(Vec::new()));
    for (tid, mailbox) in mailboxes.iter().enumerate() {
        for extra in 0..2 {
            let msg = request_msg(&stack, (tid * 10 + extra) as u32);
            let sink = Rc::clone(&cancelled);
            stack
                .send_request_to_mailbox(
                    &msg,
                    *mailbox,
                    Some(Box::new(move |_, m, was_cancelled| {
                        sink.borrow_mut().push((m.tid(), was_cancelled));
                    })),
                )
                .expect("send");
        }
    }

    stack.context_free(ctx).expect("free");

    let mut seen = cancelled.borrow().clone();
    seen.sort_unstable();
    let mut expected: Vec<(u32, bool)> = (0..4)
        .flat_map(|t| [(t * 10, true), (t * 10 + 1, true)])
        .collect();
    expected.sort_unstable();
    assert_eq!(seen, expected);
    assert!(journal.borrow().executed.is_empty());
    assert_eq!(journal.borrow().closed, vec![node]);
    assert!(!stack.context_exists(ctx));
    assert_eq!(stack.heap().in_use(), baseline);
    assert_eq!(stack.plugin_nodes(), vec![MASTER_NODE]);
}

#[test]
fn out_of_range_destination_performs_no_allocation() {
    let (mut stack, _) = parking_stack();
    let msg = request_msg(&stack, 0);
    let live = stack.heap().live_allocations();
    for dest in [NodeAddr(8), NodeAddr(100), NodeAddr(-2)] {
        assert!(matches!(
            stack.send_request(&msg, dest, None),
            Err(A2bError::InvalidParameter(_))
        ));
    }
    assert_eq!(stack.heap().live_allocations(), live);
    assert!(!msg.is_in_flight());
}

#[test]
fn suspended_request_resumes_through_exec_update() {
    let (mut stack, journal) = parking_stack();
    let node = NodeAddr(0);
    let ctx = stack
        .find_handler(ContextId::Application, NodeSignature::new(node, 1, 1, 1))
        .expect("bind");
    let mailbox = stack.default_mailbox(node).expect("mailbox");

    let first = request_msg(&stack, 1);
    let second = request_msg(&stack, 2);
    let done = Rc::new(Cell::new(0));
    for msg in [&first, &second] {
        let done = Rc::clone(&done);
        stack
            .send_request_to_mailbox(
                msg,
                mailbox,
                Some(Box::new(move |_, _, cancelled| {
                    if !cancelled {
                        done.set(done.get() + 1);
                    }
                })),
            )
            .expect("send");
    }

    for _ in 0..9 {
        stack.tick();
    }
    // Only the head ran, once; it is parked until resumed.
    assert_eq!(journal.borrow().executed, vec![1]);
    let head = stack
        .get_executing_message(ctx, mailbox)
        .expect("lookup")
        .expect("head");
    assert!(MessageRef::ptr_eq(&head, &first));
    drop(head);

    first
        .write_body(&StatusReply {
            status: ResultCode::SUCCESS,
        })
        .expect("write");
    stack
        .exec_update(ctx, mailbox, Action::Complete)
        .expect("update");
    assert_eq!(done.get(), 1);
    assert_eq!(first.ref_count(), 1);
    assert!(first.was_delivered());

    for _ in 0..9 {
        stack.tick();
    }
    assert_eq!(journal.borrow().executed, vec![1, 2]);
    let head = stack
        .get_executing_message(ctx, mailbox)
        .expect("lookup")
        .expect("head");
    assert!(MessageRef::ptr_eq(&head, &second));
}

#[test]
fn exec_update_rejects_foreign_mailboxes() {
    let (mut stack, _) = parking_stack();
    let a = stack
        .find_handler(ContextId::Application, NodeSignature::new(NodeAddr(0), 1, 1, 1))
        .expect("bind");
    stack
        .find_handler(ContextId::Application, NodeSignature::new(NodeAddr(1), 1, 1, 1))
        .expect("bind");
    let foreign = stack.default_mailbox(NodeAddr(1)).expect("mailbox");
    assert!(matches!(
        stack.exec_update(a, foreign, Action::Complete),
        Err(A2bError::Permission(_))
    ));
    assert!(matches!(
        stack.get_executing_message(ContextId::Application, foreign),
        Err(A2bError::Permission(_))
    ));
    assert_eq!(
        stack
            .exec_update(ContextId::Plugin(NodeAddr(5)), foreign, Action::Complete)
            .unwrap_err(),
        A2bError::DoesNotExist
    );
}

#[test]
fn request_in_flight_cannot_be_sent_twice() {
    let (mut stack, _) = parking_stack();
    stack
        .find_handler(ContextId::Application, NodeSignature::new(NodeAddr(3), 1, 1, 1))
        .expect("bind");
    let msg = request_msg(&stack, 0);
    stack.send_request(&msg, NodeAddr(3), None).expect("send");
    assert_eq!(
        stack.send_request(&msg, NodeAddr(3), None).unwrap_err(),
        A2bError::ResourceUnavailable
    );
}

#[test]
fn notify_is_synchronous_and_ordered() {
    let (mut stack, _) = parking_stack();
    let order = Rc::new(RefCell::new(Vec::new()));
    for tag in ["a", "b"] {
        let order = Rc::clone(&order);
        stack
            .register_notifier(
                ContextId::Application,
                notify::NODE_DISCOVERED,
                Box::new(move |_, msg| order.borrow_mut().push((tag, msg.tid()))),
                None,
            )
            .expect("register");
    }
    let msg = Message::alloc(
        &stack,
        ContextId::Application,
        MessageType::Notify,
        notify::NODE_DISCOVERED,
    )
    .expect("alloc");
    msg.set_tid(7);

    assert_eq!(stack.notify(&msg).expect("notify"), 2);
    // Delivered before notify returned; no tick needed.
    assert_eq!(order.borrow().as_slice(), [("a", 7), ("b", 7)]);
    assert_eq!(stack.ticks(), 0);
}

#[test]
fn plugin_notifiers_are_dropped_with_their_context() {
    let (mut stack, _) = parking_stack();
    let ctx = stack
        .find_handler(ContextId::Application, NodeSignature::new(NodeAddr(4), 1, 1, 1))
        .expect("bind");
    let hits = Rc::new(Cell::new(0));
    let destroyed = Rc::new(Cell::new(0));
    let (h, d) = (Rc::clone(&hits), Rc::clone(&destroyed));
    stack
        .register_notifier(
            ctx,
            notify::POWER_FAULT,
            Box::new(move |_, _| h.set(h.get() + 1)),
            Some(Box::new(move || d.set(d.get() + 1))),
        )
        .expect("register");

    let msg = Message::alloc(
        &stack,
        ContextId::Application,
        MessageType::Notify,
        notify::POWER_FAULT,
    )
    .expect("alloc");
    stack.notify(&msg).expect("notify");
    stack.context_free(ctx).expect("free");
    stack.notify(&msg).expect("notify");

    assert_eq!(hits.get(), 1);
    assert_eq!(destroyed.get(), 1);
}

#[test]
fn status_reply_survives_the_payload() {
    let (stack, _) = parking_stack();
    let msg = request_msg(&stack, 0);
    let status = A2bError::ResourceUnavailable.code(Facility::Plugin);
    msg.write_body(&StatusReply { status }).expect("write");
    let decoded = msg.read_body::<StatusReply>().expect("decode");
    assert_eq!(
        decoded.status.into_result(),
        Some(Err(A2bError::ResourceUnavailable))
    );
}

#[test]
fn dropping_the_stack_cancels_outstanding_requests() {
    let (mut stack, journal) = parking_stack();
    stack
        .find_handler(ContextId::Application, NodeSignature::new(NodeAddr(1), 1, 1, 1))
        .expect("bind");
    let msg = request_msg(&stack, 9);
    let cancelled = Rc::new(Cell::new(false));
    let flag = Rc::clone(&cancelled);
    stack
        .send_request(
            &msg,
            NodeAddr(1),
            Some(Box::new(move |_, _, was_cancelled| flag.set(was_cancelled))),
        )
        .expect("send");
    drop(stack);
    assert!(cancelled.get());
    assert!(!msg.is_in_flight());
    assert_eq!(msg.ref_count(), 1);
    assert!(journal.borrow().closed.contains(&NodeAddr(1)));
}

#[test]
fn teardown_cancels_requests_while_sibling_contexts_still_exist() {
    let (mut stack, journal) = parking_stack();
    let seen = Rc::new(RefCell::new(Vec::new()));
    for (node, sibling) in [(NodeAddr(0), NodeAddr(1)), (NodeAddr(1), NodeAddr(0))] {
        stack
            .find_handler(ContextId::Application, NodeSignature::new(node, 1, 1, 1))
            .expect("bind");
        let msg = request_msg(&stack, node.0 as u32);
        let sink = Rc::clone(&seen);
        stack
            .send_request(
                &msg,
                node,
                Some(Box::new(move |stack, _, cancelled| {
                    let sibling_alive = stack.context_exists(ContextId::Plugin(sibling));
                    sink.borrow_mut().push((node, cancelled, sibling_alive));
                })),
            )
            .expect("send");
    }
    for _ in 0..9 {
        stack.tick();
    }
    assert_eq!(journal.borrow().executed.len(), 2);
    assert!(seen.borrow().is_empty());

    drop(stack);
    assert_eq!(
        seen.borrow().as_slice(),
        [(NodeAddr(0), true, true), (NodeAddr(1), true, true)]
    );
}
