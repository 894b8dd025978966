//! Hardware flow programs: stage ordering, the rule catalog, installation
//! and counter queries.

mod builder;
mod catalog;
mod counters;
mod installer;
mod stage;

pub use builder::{FlowHandle, RuleBuilder, RuleContext};
pub use catalog::{default_plan, CatalogRule};
pub use counters::{log_counters, CounterError, CounterMonitor};
pub use installer::{FlowInstallError, FlowInstaller, InstallTarget, InstalledFlow, InstalledFlows};
pub use stage::{FlowStage, UnknownStage};
