// Domain layer: service models and the capability traits the core talks through.

pub mod model;
pub mod ports;
