//! A2B stack control core.
//!
//! This crate implements the cooperative, tick-driven runtime that sits at
//! the heart of the stack: the job executor and its mailboxes, reference
//! counted messages, the message router, the plugin registry that owns node
//! lifecycles, and the peripheral sequencer that walks init/deinit requests
//! across every discovered slave node.
//!
//! Everything here runs on one logical thread. The only entry point that
//! advances scheduling state is [`stack::Stack::tick`].

pub mod commands;
pub mod config;
pub mod context;
pub mod executor;
pub mod heap;
pub mod job;
pub mod message;
pub mod notifier;
pub mod plugin;
pub mod queue;
pub mod router;
pub mod sequencer;
pub mod stack;

pub use a2b_core::{A2bError, NodeAddr, NodeSignature, MASTER_NODE};
pub use config::StackConfig;
pub use context::{ContextId, Domain};
pub use job::Action;
pub use message::{Message, MessageRef, MessageType};
pub use plugin::{Plugin, PluginHandle};
pub use queue::{MailboxId, Priority};
pub use sequencer::PeriphOp;
pub use stack::Stack;
