//! Fixtures for exercising heron workers without a real broker.
//!
//! - [`TestTask`] - a small serde payload
//! - [`ScriptedProcessor`] - a [`heron::JobProcessor`] whose failures are scripted
//! - [`CountingConnector`] - an in-memory connector that counts dials
//! - [`TestHarness`] - broker, connection, ledger and event bus wired together

pub mod harness;
pub mod job;
pub mod mock;

pub use harness::*;
pub use job::*;
pub use mock::*;
