/// Runtime builder for constructing heron instances.
pub mod builder;
/// Runtime supervisor managing worker slots and housekeeping.
pub mod supervisor;

pub use builder::HeronRuntimeBuilder;
pub use supervisor::{HeronRuntime, ShutdownToken};
