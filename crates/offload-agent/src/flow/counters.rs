//! Hit/byte counter queries against the counting stage's flows.

use log::{debug, warn};
use offload_hal::{FlowApi, FlowCounters, FlowOid, HalError};
use offload_types::PortId;
use thiserror::Error;

/// Counter query errors.
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("port {port}: counter query for flow {flow} failed: {source}")]
    Query {
        port: PortId,
        flow: FlowOid,
        #[source]
        source: HalError,
    },

    #[error("counter query failed {failures} times in a row: {source}")]
    BudgetExhausted {
        failures: u32,
        #[source]
        source: HalError,
    },
}

impl CounterError {
    pub fn hal_error(&self) -> &HalError {
        match self {
            CounterError::Query { source, .. } | CounterError::BudgetExhausted { source, .. } => {
                source
            }
        }
    }

    /// True when a later query may succeed. An exhausted budget never is.
    pub fn is_retryable(&self) -> bool {
        match self {
            CounterError::Query { source, .. } => source.is_retryable(),
            CounterError::BudgetExhausted { .. } => false,
        }
    }
}

/// Reads the counted flows of one port and applies the failure budget.
///
/// A budget of zero makes every failure fatal. Otherwise up to `budget`
/// consecutive retryable failures are logged and skipped; a success resets
/// the run.
#[derive(Debug, Clone)]
pub struct CounterMonitor {
    port: PortId,
    flows: Vec<FlowOid>,
    budget: u32,
    consecutive_failures: u32,
    last: FlowCounters,
}

impl CounterMonitor {
    pub fn new(port: PortId, flows: Vec<FlowOid>, budget: u32) -> Self {
        Self {
            port,
            flows,
            budget,
            consecutive_failures: 0,
            last: FlowCounters::default(),
        }
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Totals from the last successful query.
    pub fn last(&self) -> FlowCounters {
        self.last
    }

    /// Sums the counters of every monitored flow. Fails on the first error.
    pub fn query(&self, flows: &dyn FlowApi) -> Result<FlowCounters, CounterError> {
        let mut total = FlowCounters::default();
        for flow in &self.flows {
            let counters = flows
                .query_count(self.port, *flow)
                .map_err(|source| CounterError::Query {
                    port: self.port,
                    flow: *flow,
                    source,
                })?;
            total.hits += counters.hits;
            total.bytes += counters.bytes;
        }
        Ok(total)
    }

    /// Queries and applies the failure budget.
    ///
    /// Returns `Ok(None)` for a tolerated failure.
    pub fn check(&mut self, flows: &dyn FlowApi) -> Result<Option<FlowCounters>, CounterError> {
        match self.query(flows) {
            Ok(total) => {
                self.consecutive_failures = 0;
                self.last = total;
                Ok(Some(total))
            }
            Err(err) if !err.is_retryable() => Err(err),
            Err(err) => {
                if self.consecutive_failures >= self.budget {
                    let failures = self.consecutive_failures + 1;
                    return Err(CounterError::BudgetExhausted {
                        failures,
                        source: err.hal_error().clone(),
                    });
                }
                self.consecutive_failures += 1;
                warn!(
                    "{} (tolerated, {}/{})",
                    err, self.consecutive_failures, self.budget
                );
                Ok(None)
            }
        }
    }
}

/// Logs one summary of `monitor`'s flows. Used once after the counting stage.
pub fn log_counters(monitor: &CounterMonitor, flows: &dyn FlowApi) -> Result<FlowCounters, CounterError> {
    let total = monitor.query(flows)?;
    debug!(
        "Port {}: {} counted flows, hits={} bytes={}",
        monitor.port(),
        monitor.flow_count(),
        total.hits,
        total.bytes
    );
    Ok(total)
}
