pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::{CliConfig, LogFormat};

pub use adapters::{DockerRuntime, HostPortScanner, LocalStorage};
pub use config::stack_config::StackConfig;
pub use self::core::{
    catalog::{CatalogSource, ServiceCatalog},
    context::{RunContext, Selection},
    orchestrator::{AbortReason, Orchestrator, OrchestratorState, RunOutcome},
    report::RunReport,
};
pub use utils::error::{OrchestratorError, Result};
