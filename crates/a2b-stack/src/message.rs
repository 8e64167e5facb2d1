use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::mem::size_of;
use std::ops::Deref;
use std::rc::Rc;

use a2b_core::{A2bError, NodeAddr};

use crate::commands::{self, Body};
use crate::context::ContextId;
use crate::heap::HeapLease;
use crate::job::JobRef;
use crate::stack::Stack;

/// Message kind; scopes which command ids are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Notify,
    Custom,
}

impl MessageType {
    pub fn is_valid_cmd(self, cmd: u32) -> bool {
        match self {
            Self::Request => cmd < commands::request::MAX || cmd >= commands::request::CUSTOM,
            Self::Notify => cmd < commands::notify::MAX || cmd >= commands::notify::CUSTOM,
            Self::Custom => true,
        }
    }
}

/// Callback run when a routed request finishes or is cancelled.
pub type Completion = Box<dyn FnOnce(&mut Stack, &MessageRef, bool)>;

type Destructor = Box<dyn FnOnce(Box<dyn Any>)>;

struct UserData {
    value: Box<dyn Any>,
    destructor: Option<Destructor>,
}

/// Unit of request/notification traffic.
///
/// Messages are shared through [`MessageRef`]; the router holds its own
/// reference while the message sits in a mailbox.
pub struct Message {
    msg_type: Cell<MessageType>,
    cmd: Cell<u32>,
    tid: Cell<u32>,
    source: ContextId,
    dest_node: Cell<Option<NodeAddr>>,
    dest_context: Cell<Option<ContextId>>,
    in_flight: Cell<bool>,
    delivered: Cell<bool>,
    payload: RefCell<Box<[u8]>>,
    user_data: RefCell<Option<UserData>>,
    pub(crate) completion: RefCell<Option<Completion>>,
    _lease: HeapLease,
}

impl Message {
    /// Allocates a message owned by `source` with one reference.
    pub fn alloc(
        stack: &Stack,
        source: ContextId,
        msg_type: MessageType,
        cmd: u32,
    ) -> Result<MessageRef, A2bError> {
        if !msg_type.is_valid_cmd(cmd) {
            return Err(A2bError::InvalidParameter("command id not valid for type"));
        }
        if !stack.context_exists(source) {
            return Err(A2bError::DoesNotExist);
        }
        let capacity = stack.payload_capacity();
        let lease = stack.heap().try_alloc(size_of::<Self>() + capacity)?;
        Ok(MessageRef(Rc::new(Self {
            msg_type: Cell::new(msg_type),
            cmd: Cell::new(cmd),
            tid: Cell::new(0),
            source,
            dest_node: Cell::new(None),
            dest_context: Cell::new(None),
            in_flight: Cell::new(false),
            delivered: Cell::new(false),
            payload: RefCell::new(vec![0_u8; capacity].into_boxed_slice()),
            user_data: RefCell::new(None),
            completion: RefCell::new(None),
            _lease: lease,
        })))
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type.get()
    }

    /// Changes the type; the current command must stay valid for it.
    pub fn set_type(&self, msg_type: MessageType) -> Result<(), A2bError> {
        if !msg_type.is_valid_cmd(self.cmd.get()) {
            return Err(A2bError::InvalidParameter("command id not valid for type"));
        }
        self.msg_type.set(msg_type);
        Ok(())
    }

    pub fn cmd(&self) -> u32 {
        self.cmd.get()
    }

    pub fn set_cmd(&self, cmd: u32) -> Result<(), A2bError> {
        if !self.msg_type.get().is_valid_cmd(cmd) {
            return Err(A2bError::InvalidParameter("command id not valid for type"));
        }
        self.cmd.set(cmd);
        Ok(())
    }

    pub fn tid(&self) -> u32 {
        self.tid.get()
    }

    pub fn set_tid(&self, tid: u32) {
        self.tid.set(tid);
    }

    pub fn source(&self) -> ContextId {
        self.source
    }

    /// Destination node, set when a request is routed.
    pub fn dest_node(&self) -> Option<NodeAddr> {
        self.dest_node.get()
    }

    pub fn dest_context(&self) -> Option<ContextId> {
        self.dest_context.get()
    }

    pub(crate) fn set_destination(&self, node: NodeAddr, context: ContextId) {
        self.dest_node.set(Some(node));
        self.dest_context.set(Some(context));
    }

    /// Whether the message currently sits in a mailbox.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.get()
    }

    pub(crate) fn set_in_flight(&self, in_flight: bool) {
        self.in_flight.set(in_flight);
    }

    /// Whether a plugin's execute hook has seen this message.
    pub fn was_delivered(&self) -> bool {
        self.delivered.get()
    }

    pub(crate) fn mark_delivered(&self) {
        self.delivered.set(true);
    }

    pub fn payload(&self) -> Ref<'_, [u8]> {
        Ref::map(self.payload.borrow(), |p| &p[..])
    }

    pub fn payload_mut(&self) -> RefMut<'_, [u8]> {
        RefMut::map(self.payload.borrow_mut(), |p| &mut p[..])
    }

    pub fn payload_capacity(&self) -> usize {
        self.payload.borrow().len()
    }

    pub fn write_body<B: Body>(&self, body: &B) -> Result<(), A2bError> {
        let mut payload = self.payload.borrow_mut();
        let out = payload
            .get_mut(..B::SIZE)
            .ok_or(A2bError::InvalidParameter("body exceeds payload capacity"))?;
        body.encode(out);
        Ok(())
    }

    pub fn read_body<B: Body>(&self) -> Option<B> {
        B::decode(&self.payload.borrow())
    }

    /// Attaches user data; a previous value is destroyed first.
    pub fn set_user_data(&self, value: Box<dyn Any>, destructor: Option<Destructor>) {
        let previous = self
            .user_data
            .borrow_mut()
            .replace(UserData { value, destructor });
        if let Some(previous) = previous {
            previous.destroy();
        }
    }

    pub fn user_data<T: 'static>(&self) -> Option<Ref<'_, T>> {
        Ref::filter_map(self.user_data.borrow(), |data| {
            data.as_ref().and_then(|d| d.value.downcast_ref::<T>())
        })
        .ok()
    }
}

impl UserData {
    fn destroy(self) {
        if let Some(destructor) = self.destructor {
            destructor(self.value);
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Some(data) = self.user_data.get_mut().take() {
            data.destroy();
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.msg_type.get())
            .field("cmd", &self.cmd.get())
            .field("tid", &self.tid.get())
            .field("source", &self.source)
            .field("dest_node", &self.dest_node.get())
            .field("in_flight", &self.in_flight.get())
            .finish()
    }
}

/// Counted reference to a [`Message`]. Cloning adds a reference; dropping
/// the last one destroys the message.
#[derive(Clone)]
pub struct MessageRef(pub(crate) Rc<Message>);

impl MessageRef {
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    pub(crate) fn into_job(self) -> JobRef<Stack> {
        self.0
    }
}

impl Deref for MessageRef {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.0
    }
}

impl fmt::Debug for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::{Message, MessageType};
    use crate::commands::{notify, request, StatusReply, BODY_UNION_SIZE};
    use crate::config::StackConfig;
    use crate::context::ContextId;
    use crate::stack::Stack;
    use a2b_core::{A2bError, ResultCode};

    fn stack() -> Stack {
        Stack::new(StackConfig::default(), Vec::new()).expect("stack")
    }

    #[test]
    fn command_validity_is_type_scoped() {
        assert!(MessageType::Request.is_valid_cmd(request::PERIPH_INIT));
        assert!(!MessageType::Request.is_valid_cmd(request::MAX));
        assert!(MessageType::Request.is_valid_cmd(request::CUSTOM + 7));
        assert!(MessageType::Notify.is_valid_cmd(notify::INTERRUPT));
        assert!(!MessageType::Notify.is_valid_cmd(0x0FFF));
        assert!(MessageType::Custom.is_valid_cmd(0x0FFF));
    }

    #[test]
    fn alloc_rejects_invalid_command_without_allocating() {
        let stack = stack();
        let before = stack.heap().in_use();
        let err = Message::alloc(&stack, ContextId::Application, MessageType::Notify, 0x0800)
            .unwrap_err();
        assert!(matches!(err, A2bError::InvalidParameter(_)));
        assert_eq!(stack.heap().in_use(), before);
    }

    #[test]
    fn references_free_storage_exactly_once() {
        let stack = stack();
        let before = stack.heap().in_use();
        let destroyed = Rc::new(Cell::new(0_u32));

        let msg = Message::alloc(&stack, ContextId::Application, MessageType::Request, 0)
            .expect("alloc");
        assert_eq!(msg.ref_count(), 1);
        let counter = Rc::clone(&destroyed);
        msg.set_user_data(
            Box::new(42_u32),
            Some(Box::new(move |_| counter.set(counter.get() + 1))),
        );

        let extra = msg.clone();
        assert_eq!(msg.ref_count(), 2);
        drop(extra);
        assert_eq!(destroyed.get(), 0);
        assert!(stack.heap().in_use() > before);
        drop(msg);
        assert_eq!(destroyed.get(), 1);
        assert_eq!(stack.heap().in_use(), before);
    }

    #[test]
    fn mutators_keep_command_valid_for_type() {
        let stack = stack();
        let msg = Message::alloc(&stack, ContextId::Application, MessageType::Request, 0)
            .expect("alloc");
        assert!(msg.set_cmd(request::CUSTOM).is_ok());
        assert!(msg.set_type(MessageType::Notify).is_ok());
        assert!(msg.set_cmd(request::PLUGIN_VERSION).is_err());
        assert_eq!(msg.cmd(), request::CUSTOM);
        msg.set_tid(0xBEEF);
        assert_eq!(msg.tid(), 0xBEEF);
    }

    #[test]
    fn payload_is_fixed_capacity_and_zeroed() {
        let stack = stack();
        let msg = Message::alloc(&stack, ContextId::Application, MessageType::Request, 0)
            .expect("alloc");
        assert_eq!(msg.payload_capacity(), stack.payload_capacity());
        assert!(msg.payload_capacity() >= BODY_UNION_SIZE);
        assert!(msg.payload().iter().all(|b| *b == 0));

        msg.write_body(&StatusReply {
            status: ResultCode::SUCCESS,
        })
        .expect("write");
        assert_eq!(
            msg.read_body::<StatusReply>().map(|r| r.status),
            Some(ResultCode::SUCCESS)
        );
    }

    #[test]
    fn user_data_downcasts_to_stored_type() {
        let stack = stack();
        let msg = Message::alloc(&stack, ContextId::Application, MessageType::Custom, 99)
            .expect("alloc");
        msg.set_user_data(Box::new(String::from("owner")), None);
        assert_eq!(msg.user_data::<String>().as_deref().map(String::as_str), Some("owner"));
        assert!(msg.user_data::<u32>().is_none());
    }
}
