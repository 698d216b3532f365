pub mod catalog;
pub mod context;
pub mod health;
pub mod launcher;
pub mod orchestrator;
pub mod port_allocator;
pub mod report;
pub mod scheduler;

pub use crate::domain::model::{
    HealthOutcome, LaunchResult, PortBinding, PortPlan, ProbeKind, ProbeSpec, ServiceSpec,
    ServiceStatus, Wave,
};
pub use crate::domain::ports::{ContainerRuntime, PortScanner, StartRequest, Storage};
pub use crate::utils::error::Result;
