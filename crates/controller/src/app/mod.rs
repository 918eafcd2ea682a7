//! Application module
//!
//! Lifecycle of the daemon: building the shared services from the command
//! line and configuration file, running the tick scheduler and the API
//! server, and shutting both down on SIGINT/SIGTERM.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

// Re-export main types
pub use builder::ApplicationBuilder;
pub use core::Application;
pub use services::ApplicationServices;
