use error_stack::Report;

pub mod api;
pub mod app;
pub mod cgroup;
pub mod config;
pub mod domain;
mod error;
pub mod infrastructure;

/// Result type using error-stack for context-rich error reporting
pub type Result<T, C> = core::result::Result<T, Report<C>>;

pub use error::ControllerError;

// Re-export main modules
pub use domain::registry;
pub use domain::scheduler;
pub use domain::slope;
pub use infrastructure::logging;
pub use infrastructure::metrics;
