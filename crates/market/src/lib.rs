//! Auction-based CPU cycle market.
//!
//! This crate decides, once per tick, how many cycles per second each entity
//! (a VM or a single vCPU) may consume. It is pure computation: callers feed
//! [`EntitySnapshot`]s built from their telemetry and apply the returned
//! [`Allocation`] themselves.
//!
//! - [`Market`]: runs base selling, bidding and leftover redistribution
//! - [`Ledger`]: per-entity currency earned by leaving guaranteed cycles unused

use error_stack::Report;

mod config;
mod entity;
mod error;
mod ledger;
mod market;


/// Result type using error-stack for context-rich error reporting
pub type Result<T, C> = core::result::Result<T, Report<C>>;

pub use config::{MarketConfig, NominalPolicy};
pub use entity::{Band, Capping, EntitySnapshot, CYCLES_PER_CPU};
pub use error::MarketError;
pub use ledger::Ledger;
pub use market::{Allocation, Market, MarketReport, FLAT_SLOPE};
