//! Flow API: hardware rule lifecycle and counters.

use offload_types::PortId;

use crate::error::HalResult;
use crate::flow::{FlowCounters, FlowSpec};
use crate::types::FlowOid;

/// Flow-rule operations.
pub trait FlowApi: Send + Sync {
    /// Compiles and installs a rule. The rule takes effect immediately.
    fn create(&self, port: PortId, spec: &FlowSpec) -> HalResult<FlowOid>;

    /// Removes a single rule.
    fn destroy(&self, port: PortId, flow: FlowOid) -> HalResult<()>;

    /// Removes every rule on the port.
    fn flush(&self, port: PortId) -> HalResult<()>;

    /// Reads the hit/byte counters of a rule carrying a COUNT action.
    fn query_count(&self, port: PortId, flow: FlowOid) -> HalResult<FlowCounters>;
}
