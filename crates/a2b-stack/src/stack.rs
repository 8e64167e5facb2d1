use std::fmt;
use std::mem::{self, size_of};
use std::rc::Rc;

use a2b_core::{A2bError, NodeAddr, NodeSignature, MASTER_NODE};
use tracing::{debug, warn};

use crate::config::StackConfig;
use crate::context::{Binding, ContextId, PluginContext, PluginTable};
use crate::executor::{self, JobExecutor};
use crate::heap::{Heap, HeapLease};
use crate::job::JobHost;
use crate::notifier::NotifierList;
use crate::plugin::{BoundHandle, Plugin};
use crate::queue::{MailboxId, Priority};

/// Stack aggregate: heap, executor, Application context, and the plugin
/// table indexed by node address.
///
/// Dropping the stack tears down the Application context, which frees
/// every plugin context it still owns.
pub struct Stack {
    config: StackConfig,
    heap: Rc<Heap>,
    executor: JobExecutor<Stack>,
    plugins: Vec<Rc<dyn Plugin>>,
    pub(crate) table: PluginTable,
    pub(crate) notifiers: NotifierList,
    app: Option<HeapLease>,
    tick_calls: u64,
    passes: u64,
}

impl JobHost for Stack {
    fn executor(&mut self) -> &mut JobExecutor<Stack> {
        &mut self.executor
    }
}

impl Stack {
    /// Brings up a stack whose discovery probes `plugins` in order.
    ///
    /// Fails with `AllocFailure` when the configured heap cannot hold the
    /// Application context; nothing stays allocated in that case.
    pub fn new(config: StackConfig, plugins: Vec<Rc<dyn Plugin>>) -> Result<Self, A2bError> {
        config
            .validate()
            .map_err(|_| A2bError::InvalidParameter("invalid stack config"))?;
        let heap = Heap::new(config.heap_limit);
        let app = heap.try_alloc(size_of::<Self>())?;
        let executor = JobExecutor::new(Rc::clone(&heap))?;
        debug!(
            max_slaves = config.max_slaves,
            plugins = plugins.len(),
            "stack allocated"
        );
        Ok(Self {
            table: PluginTable::new(config.max_slaves),
            config,
            heap,
            executor,
            plugins,
            notifiers: NotifierList::default(),
            app: Some(app),
            tick_calls: 0,
            passes: 0,
        })
    }

    pub fn register_plugin(&mut self, plugin: Rc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn heap(&self) -> &Rc<Heap> {
        &self.heap
    }

    pub fn payload_capacity(&self) -> usize {
        self.config.payload_capacity()
    }

    /// Whether the Application context is still alive.
    pub fn is_alive(&self) -> bool {
        self.app.is_some()
    }

    /// Number of executor passes run so far.
    pub fn ticks(&self) -> u64 {
        self.passes
    }

    /// Advances the stack by one tick.
    ///
    /// Runs one executor pass every `tick_multiple` calls and returns the
    /// number of jobs it executed.
    pub fn tick(&mut self) -> usize {
        if !self.is_alive() {
            return 0;
        }
        self.tick_calls += 1;
        if self.tick_calls % u64::from(self.config.tick_multiple) != 0 {
            return 0;
        }
        self.passes += 1;
        executor::schedule(self)
    }

    pub fn context_exists(&self, context: ContextId) -> bool {
        match context {
            ContextId::Application => self.is_alive(),
            ContextId::Plugin(node) => self.table.contains(node),
        }
    }

    /// Nodes with a plugin context, in address order.
    pub fn plugin_nodes(&self) -> Vec<NodeAddr> {
        self.table.nodes()
    }

    pub fn plugin_name(&self, node: NodeAddr) -> Option<&str> {
        self.table.get(node)?.plugin_name()
    }

    pub fn signature(&self, node: NodeAddr) -> Option<NodeSignature> {
        self.table.get(node).map(|ctx| ctx.signature)
    }

    pub fn mailboxes(&self, context: ContextId) -> Vec<MailboxId> {
        context
            .node()
            .and_then(|node| self.table.get(node))
            .map(|ctx| ctx.mailboxes.clone())
            .unwrap_or_default()
    }

    pub fn default_mailbox(&self, node: NodeAddr) -> Option<MailboxId> {
        self.table.get(node)?.default_mailbox()
    }

    pub(crate) fn require_alive(&self) -> Result<(), A2bError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(A2bError::DoesNotExist)
        }
    }

    pub(crate) fn node_in_range(&self, node: NodeAddr) -> bool {
        self.table.in_range(node)
    }

    pub(crate) fn job_executor(&self) -> &JobExecutor<Stack> {
        &self.executor
    }

    pub(crate) fn bound_handle(&self, node: NodeAddr) -> Option<Rc<BoundHandle>> {
        let binding = self.table.get(node)?.binding.as_ref()?;
        Some(Rc::clone(&binding.handle))
    }

    pub(crate) fn check_mailbox_owner(
        &self,
        context: ContextId,
        mailbox: MailboxId,
    ) -> Result<(), A2bError> {
        let ContextId::Plugin(node) = context else {
            return Err(A2bError::Permission("application context owns no mailboxes"));
        };
        let ctx = self.table.get(node).ok_or(A2bError::DoesNotExist)?;
        if !ctx.owns(mailbox) {
            return Err(A2bError::Permission("mailbox not owned by context"));
        }
        Ok(())
    }

    /// Allocates an unbound plugin context for `signature.node_addr` with
    /// its default mailbox.
    pub fn alloc_plugin_context(&mut self, signature: NodeSignature) -> Result<ContextId, A2bError> {
        self.require_alive()?;
        let node = signature.node_addr;
        if !self.table.in_range(node) {
            return Err(A2bError::InvalidParameter("node address out of range"));
        }
        if self.table.contains(node) {
            return Err(A2bError::ResourceUnavailable);
        }
        let lease = self.heap.try_alloc(size_of::<PluginContext>())?;
        let mailbox = self.executor.alloc_queue(Priority::DEFAULT_MAILBOX)?;
        if let Err(err) = self
            .table
            .insert(node, PluginContext::new(signature, mailbox, lease))
        {
            if let Err(release_err) = executor::release(self, mailbox) {
                warn!(%node, %mailbox, err = %release_err, "failed to free mailbox of unused context");
            }
            return Err(err);
        }
        debug!(%node, %mailbox, "plugin context allocated");
        Ok(ContextId::Plugin(node))
    }

    /// Frees a context.
    ///
    /// A plugin context closes its handle, flushes and frees its mailboxes,
    /// drops its notifiers, and leaves the table. Freeing the Application
    /// context tears down the whole stack.
    pub fn context_free(&mut self, context: ContextId) -> Result<(), A2bError> {
        let node = match context {
            ContextId::Application => {
                self.require_alive()?;
                self.teardown();
                return Ok(());
            }
            ContextId::Plugin(node) => node,
        };

        let ctx = self.table.get_mut(node).ok_or(A2bError::DoesNotExist)?;
        if let Some(binding) = &ctx.binding {
            binding.handle.close();
        }
        let mailboxes = mem::take(&mut ctx.mailboxes);
        for mailbox in mailboxes {
            if let Err(err) = executor::release(self, mailbox) {
                warn!(%node, %mailbox, %err, "failed to free mailbox");
            }
        }
        self.notifiers.unregister_owner(context);

        let sequence = self
            .table
            .remove(node)
            .and_then(|mut ctx| ctx.sequence.take());
        debug!(%node, "plugin context freed");
        if let Some(active) = sequence {
            (active.on_done)(self, Err(A2bError::Cancelled));
        }
        Ok(())
    }

    /// Discovery: binds the first registered plugin that accepts `signature`.
    ///
    /// A tentative context is allocated for the node and each plugin's
    /// `open` is probed in registration order. When every plugin declines,
    /// the tentative context is freed and `ResourceUnavailable` returned.
    pub fn find_handler(
        &mut self,
        caller: ContextId,
        signature: NodeSignature,
    ) -> Result<ContextId, A2bError> {
        self.require_alive()?;
        if !self.context_exists(caller) {
            return Err(A2bError::DoesNotExist);
        }
        let id = self.alloc_plugin_context(signature)?;
        let node = signature.node_addr;

        let accepted = self
            .plugins
            .iter()
            .find_map(|plugin| plugin.open(id, &signature).map(|h| (Rc::clone(plugin), h)));

        match accepted {
            Some((plugin, handle)) => {
                let ctx = self
                    .table
                    .get_mut(node)
                    .ok_or(A2bError::Internal("tentative context vanished"))?;
                debug!(%node, plugin = plugin.name(), "plugin bound");
                ctx.binding = Some(Binding {
                    plugin,
                    handle: Rc::new(BoundHandle::new(handle)),
                });
                Ok(id)
            }
            None => {
                debug!(%node, "no plugin accepted node");
                self.context_free(id)?;
                Err(A2bError::ResourceUnavailable)
            }
        }
    }

    /// Looks up the context of `node`; the Master is discovered on first use.
    pub fn context_find(&mut self, node: NodeAddr) -> Option<ContextId> {
        if !self.is_alive() {
            return None;
        }
        if node.is_master() {
            self.ensure_master();
        }
        self.table
            .contains(node)
            .then_some(ContextId::Plugin(node))
    }

    pub(crate) fn ensure_master(&mut self) {
        if !self.is_alive() || self.table.contains(MASTER_NODE) {
            return;
        }
        let signature = self.config.master;
        if let Err(err) = self.find_handler(ContextId::Application, signature) {
            debug!(%err, "master discovery failed");
        }
    }

    /// Adds a mailbox to a plugin context.
    pub fn mailbox_alloc(
        &mut self,
        context: ContextId,
        priority: Priority,
    ) -> Result<MailboxId, A2bError> {
        self.require_alive()?;
        let ContextId::Plugin(node) = context else {
            return Err(A2bError::Permission("application context owns no mailboxes"));
        };
        if !self.table.contains(node) {
            return Err(A2bError::DoesNotExist);
        }
        let mailbox = self.executor.alloc_queue(priority)?;
        if let Some(ctx) = self.table.get_mut(node) {
            ctx.mailboxes.push(mailbox);
        }
        debug!(%node, %mailbox, priority = priority.level(), "mailbox allocated");
        Ok(mailbox)
    }

    /// Frees a mailbox; queued messages are cancelled.
    pub fn mailbox_free(&mut self, context: ContextId, mailbox: MailboxId) -> Result<(), A2bError> {
        self.check_mailbox_owner(context, mailbox)?;
        if let Some(ctx) = context.node().and_then(|node| self.table.get_mut(node)) {
            ctx.mailboxes.retain(|m| *m != mailbox);
        }
        executor::release(self, mailbox)
    }

    /// Forwards a node interrupt to its bound plugin.
    pub fn deliver_interrupt(
        &mut self,
        node: NodeAddr,
        source_mask: u8,
        type_mask: u8,
    ) -> Result<(), A2bError> {
        self.require_alive()?;
        if !self.table.in_range(node) {
            return Err(A2bError::InvalidParameter("node address out of range"));
        }
        let handle = self.bound_handle(node).ok_or(A2bError::DoesNotExist)?;
        handle.interrupt(self, ContextId::Plugin(node), source_mask, type_mask);
        Ok(())
    }

    /// Frees every plugin context and then the Application context.
    ///
    /// All mailboxes are flushed before any context leaves the table, so
    /// cancellation callbacks can still reach sibling contexts.
    pub fn teardown(&mut self) {
        let Some(app) = self.app.take() else {
            return;
        };
        debug!(contexts = self.table.len(), "stack teardown");

        for node in self.table.nodes() {
            let mailboxes = self
                .table
                .get_mut(node)
                .map(|ctx| mem::take(&mut ctx.mailboxes))
                .unwrap_or_default();
            for mailbox in mailboxes {
                if let Err(err) = executor::release(self, mailbox) {
                    warn!(%node, %mailbox, %err, "failed to free mailbox during teardown");
                }
            }
        }
        for node in self.table.nodes() {
            if let Err(err) = self.context_free(ContextId::Plugin(node)) {
                warn!(%node, %err, "failed to free plugin context during teardown");
            }
        }
        self.notifiers.clear();
        drop(app);
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("alive", &self.is_alive())
            .field("contexts", &self.table.len())
            .field("queues", &self.executor.queue_count())
            .field("notifiers", &self.notifiers.len())
            .field("heap", &self.heap)
            .finish()
    }
}
