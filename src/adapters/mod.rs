// Adapters layer: concrete implementations for external systems (docker, host sockets, filesystem).

pub mod docker;
pub mod host_ports;
pub mod storage;

pub use docker::DockerRuntime;
pub use host_ports::HostPortScanner;
pub use storage::LocalStorage;
