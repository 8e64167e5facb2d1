use std::cell::{Cell, RefCell};

use a2b_core::NodeSignature;
use tracing::warn;

use crate::context::ContextId;
use crate::job::Action;
use crate::message::MessageRef;
use crate::stack::Stack;

/// Plugin vtable: one implementation per node type.
///
/// Discovery calls [`Plugin::open`] on each registered plugin in order until
/// one returns a handle for the node.
pub trait Plugin {
    fn name(&self) -> &str;

    /// Accepts the node by returning an open handle, or declines with `None`.
    fn open(&self, context: ContextId, signature: &NodeSignature) -> Option<Box<dyn PluginHandle>>;
}

/// Open plugin instance bound to one node context.
pub trait PluginHandle {
    /// Handles a request routed to one of this context's mailboxes.
    ///
    /// Returning [`Action::Suspend`] keeps the message at the head of the
    /// mailbox until the plugin calls [`Stack::exec_update`].
    fn execute(&mut self, stack: &mut Stack, context: ContextId, message: &MessageRef) -> Action;

    fn interrupt(
        &mut self,
        _stack: &mut Stack,
        _context: ContextId,
        _source_mask: u8,
        _type_mask: u8,
    ) {
    }

    fn close(&mut self) {}
}

/// Open handle as stored in a bound context.
///
/// A handle may ask for its own context to be freed while it is executing;
/// the close then runs once the current call returns.
pub(crate) struct BoundHandle {
    inner: RefCell<Box<dyn PluginHandle>>,
    close_pending: Cell<bool>,
    closed: Cell<bool>,
}

impl BoundHandle {
    pub fn new(handle: Box<dyn PluginHandle>) -> Self {
        Self {
            inner: RefCell::new(handle),
            close_pending: Cell::new(false),
            closed: Cell::new(false),
        }
    }

    pub fn execute(&self, stack: &mut Stack, context: ContextId, message: &MessageRef) -> Action {
        if self.closed.get() || self.close_pending.get() {
            warn!(%context, "execute on closed plugin handle");
            return Action::Complete;
        }
        let Ok(mut handle) = self.inner.try_borrow_mut() else {
            warn!(%context, "plugin handle re-entered during execute");
            return Action::Suspend;
        };
        let action = handle.execute(stack, context, message);
        drop(handle);
        self.finish_pending_close();
        action
    }

    pub fn interrupt(&self, stack: &mut Stack, context: ContextId, source_mask: u8, type_mask: u8) {
        if self.closed.get() {
            return;
        }
        let Ok(mut handle) = self.inner.try_borrow_mut() else {
            warn!(%context, "interrupt while plugin handle is busy");
            return;
        };
        handle.interrupt(stack, context, source_mask, type_mask);
        drop(handle);
        self.finish_pending_close();
    }

    pub fn close(&self) {
        if self.closed.get() {
            return;
        }
        match self.inner.try_borrow_mut() {
            Ok(mut handle) => {
                handle.close();
                self.closed.set(true);
            }
            Err(_) => self.close_pending.set(true),
        }
    }

    fn finish_pending_close(&self) {
        if self.close_pending.replace(false) {
            self.close();
        }
    }
}
