//! Control loop domain: entity discovery, trend estimation and the tick
//! scheduler that ties telemetry, the market and enforcement together.

pub mod registry;
pub mod scheduler;
pub mod slope;
