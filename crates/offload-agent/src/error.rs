//! Agent error taxonomy.
//!
//! Each component has its own error enum; [`AgentError`] wraps them so
//! setup can propagate with `?` up to the binary, which classifies the
//! failure, logs it and tears down whatever was brought up.

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::flow::{CounterError, FlowInstallError};
use crate::hairpin::HairpinError;
use crate::mempool::PoolError;
use crate::ports::PortError;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The device lacks a capability the configuration requires.
    Capability,
    /// Pool, queue or port configure/start failure.
    ResourceSetup,
    /// Hairpin queue setup or binding failure.
    Topology,
    /// A flow program could not be installed.
    FlowInstall,
    /// A port's link did not come up.
    LinkDown,
    /// Counter query failure.
    CounterQuery,
    /// Invalid configuration.
    Config,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Capability => "capability",
            ErrorClass::ResourceSetup => "resource-setup",
            ErrorClass::Topology => "topology",
            ErrorClass::FlowInstall => "flow-install",
            ErrorClass::LinkDown => "link-down",
            ErrorClass::CounterQuery => "counter-query",
            ErrorClass::Config => "config",
        };
        f.write_str(s)
    }
}

/// Top-level agent error.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Hairpin(#[from] HairpinError),

    #[error(transparent)]
    FlowInstall(#[from] FlowInstallError),

    #[error(transparent)]
    Counter(#[from] CounterError),

    /// Setup was invoked out of sequence (e.g. twice, or after teardown).
    #[error("invalid agent state: {0}")]
    InvalidState(String),
}

impl AgentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AgentError::Config(_) => ErrorClass::Config,
            AgentError::Pool(_) => ErrorClass::ResourceSetup,
            AgentError::Port(e) => e.class(),
            AgentError::Hairpin(e) => e.class(),
            AgentError::FlowInstall(_) => ErrorClass::FlowInstall,
            AgentError::Counter(_) => ErrorClass::CounterQuery,
            AgentError::InvalidState(_) => ErrorClass::ResourceSetup,
        }
    }

    /// Returns true if the underlying hardware status is transient.
    ///
    /// Setup treats every error as fatal regardless; the flag only informs
    /// the caller's diagnostics and the counter-query tolerance policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Config(_) | AgentError::InvalidState(_) => false,
            AgentError::Pool(e) => e.hal_error().is_some_and(|h| h.is_retryable()),
            AgentError::Port(e) => e.hal_error().is_some_and(|h| h.is_retryable()),
            AgentError::Hairpin(e) => e.hal_error().is_some_and(|h| h.is_retryable()),
            AgentError::FlowInstall(e) => e.hal_error().is_some_and(|h| h.is_retryable()),
            AgentError::Counter(e) => e.is_retryable(),
        }
    }
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
