//! Core A2B primitives shared across crates.
//!
//! Includes node addressing, node signatures, and the stack error taxonomy.

pub mod error;
pub mod types;

pub use error::{A2bError, Facility, ResultCode, Severity};
pub use types::{NodeAddr, NodeSignature, MASTER_NODE};
