//! Simulated A2B bus for driving the stack without hardware.

pub mod bus;
pub mod plugins;
pub mod scenarios;

pub use bus::{NodeExecutions, RunReport, SimBus};
pub use plugins::{ScriptedMaster, ScriptedSlave};
pub use scenarios::{BusScenario, NodeScript, SLAVE_VENDOR_ID};
