//! Agent lifecycle: bring-up, the forwarding hand-off and teardown.

mod agent;

pub use agent::{AgentPhase, OffloadAgent, TeardownReport};
