//! Message router.
//!
//! The router is the only path by which a message enters a mailbox. A
//! routed request runs through [`Job::execute`] on its `Message`, which
//! bridges into the destination plugin's execute hook; the request's
//! completion runs when the job is finalized or its mailbox flushed.

use std::any::Any;
use std::rc::Rc;

use a2b_core::{A2bError, NodeAddr};
use tracing::{debug, trace, warn};

use crate::context::ContextId;
use crate::executor;
use crate::job::{Action, Job, JobHost};
use crate::message::{Completion, Message, MessageRef, MessageType};
use crate::notifier::{NotifierDestroy, NotifierId, NotifyCallback};
use crate::queue::MailboxId;
use crate::stack::Stack;

impl Job<Stack> for Message {
    fn execute(self: Rc<Self>, stack: &mut Stack) -> Action {
        let message = MessageRef(self);
        let Some(context) = message.dest_context() else {
            warn!(cmd = message.cmd(), "routed message has no destination context");
            return Action::Complete;
        };
        let Some(handle) = context.node().and_then(|node| stack.bound_handle(node)) else {
            warn!(%context, cmd = message.cmd(), "no plugin bound to destination");
            return Action::Complete;
        };
        message.mark_delivered();
        trace!(%context, cmd = message.cmd(), tid = message.tid(), "executing message");
        handle.execute(stack, context, &message)
    }

    fn complete(self: Rc<Self>, stack: &mut Stack, cancelled: bool) {
        self.set_in_flight(false);
        let completion = self.completion.borrow_mut().take();
        if let Some(completion) = completion {
            completion(stack, &MessageRef(self), cancelled);
        }
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

impl Stack {
    /// Routes a request into `mailbox`.
    ///
    /// On success the router holds a reference to the message until its
    /// job is finalized; `completion` then runs exactly once, with
    /// `cancelled == true` if the mailbox was flushed first.
    pub fn send_request_to_mailbox(
        &mut self,
        message: &MessageRef,
        mailbox: MailboxId,
        completion: Option<Completion>,
    ) -> Result<(), A2bError> {
        if message.msg_type() != MessageType::Request {
            return Err(A2bError::InvalidParameter("only requests can be routed"));
        }
        self.require_alive()?;
        if message.is_in_flight() {
            return Err(A2bError::ResourceUnavailable);
        }
        self.ensure_master();

        let node = self.table.owner_of(mailbox).ok_or(A2bError::DoesNotExist)?;
        let context = ContextId::Plugin(node);
        message.set_destination(node, context);

        self.executor().submit(mailbox, message.clone().into_job())?;
        message.set_in_flight(true);
        *message.completion.borrow_mut() = completion;
        debug!(
            %node,
            %mailbox,
            cmd = message.cmd(),
            tid = message.tid(),
            "request submitted"
        );
        Ok(())
    }

    /// Routes a request to the default mailbox of `dest`.
    pub fn send_request(
        &mut self,
        message: &MessageRef,
        dest: NodeAddr,
        completion: Option<Completion>,
    ) -> Result<(), A2bError> {
        if !self.node_in_range(dest) {
            return Err(A2bError::InvalidParameter("destination node out of range"));
        }
        if message.msg_type() != MessageType::Request {
            return Err(A2bError::InvalidParameter("only requests can be routed"));
        }
        self.require_alive()?;
        self.context_find(dest).ok_or(A2bError::DoesNotExist)?;
        let mailbox = self.default_mailbox(dest).ok_or(A2bError::DoesNotExist)?;
        self.send_request_to_mailbox(message, mailbox, completion)
    }

    /// Delivers a notification to every matching notifier, synchronously
    /// and in registration order. Returns the number of listeners run.
    ///
    /// No reference is taken on the caller's behalf; a listener that keeps
    /// the message must clone it.
    pub fn notify(&mut self, message: &MessageRef) -> Result<usize, A2bError> {
        if message.msg_type() == MessageType::Request {
            return Err(A2bError::InvalidParameter("requests cannot be broadcast"));
        }
        self.require_alive()?;

        let mut delivered = 0;
        for id in self.notifiers.matching(message.cmd()) {
            let Some(mut callback) = self.notifiers.take_callback(id) else {
                continue;
            };
            callback(self, message);
            self.notifiers.restore_callback(id, callback);
            delivered += 1;
        }
        trace!(cmd = message.cmd(), delivered, "notification delivered");
        Ok(delivered)
    }

    /// Registers a listener for broadcasts carrying `cmd`.
    ///
    /// Custom-type broadcasts may carry any id, so `cmd` is not limited to
    /// the notify range.
    pub fn register_notifier(
        &mut self,
        owner: ContextId,
        cmd: u32,
        callback: NotifyCallback,
        destroy: Option<NotifierDestroy>,
    ) -> Result<NotifierId, A2bError> {
        self.require_alive()?;
        if !self.context_exists(owner) {
            return Err(A2bError::DoesNotExist);
        }
        Ok(self.notifiers.register(owner, cmd, callback, destroy))
    }

    pub fn unregister_notifier(&mut self, id: NotifierId) -> Result<(), A2bError> {
        if self.notifiers.unregister(id) {
            Ok(())
        } else {
            Err(A2bError::DoesNotExist)
        }
    }

    /// Tells the executor that the job at the head of a plugin's mailbox
    /// changed state, typically after `execute` returned `Suspend`.
    pub fn exec_update(
        &mut self,
        context: ContextId,
        mailbox: MailboxId,
        action: Action,
    ) -> Result<(), A2bError> {
        self.check_mailbox_owner(context, mailbox)?;
        executor::update(self, mailbox, action)
    }

    /// Message currently at the head of a plugin's mailbox.
    pub fn get_executing_message(
        &self,
        context: ContextId,
        mailbox: MailboxId,
    ) -> Result<Option<MessageRef>, A2bError> {
        self.check_mailbox_owner(context, mailbox)?;
        let head = self.job_executor().head(mailbox);
        Ok(head
            .and_then(|job| job.into_any().downcast::<Message>().ok())
            .map(MessageRef))
    }
}
