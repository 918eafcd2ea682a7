//! HTTP API for inspecting and steering the CPU market
//!
//! # API Endpoints
//!
//! - `GET /api/v1/market` - balances and diagnostics of the last update
//! - `POST /api/v1/market/reset` - zero every balance and counter
//! - `GET /api/v1/vms` - registered VMs with the last sample of their entities
//! - `POST /api/v1/vms` - register a VM, body `{"name", "frequency", "vcpus"?}`
//! - `DELETE /api/v1/vms/:name` - unregister a VM; its entities leave the
//!   market on the next tick

use core::error::Error;

use poem::error::ResponseError;
use poem::http::StatusCode;

pub mod handlers;
pub mod server;

pub use server::ApiServer;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("VM not found: {name}")]
    VmNotFound { name: String },
    #[display("VM already registered: {name}")]
    VmExists { name: String },
    #[display("Invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

impl ResponseError for ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::VmNotFound { .. } => StatusCode::NOT_FOUND,
            Self::VmExists { .. } => StatusCode::CONFLICT,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::ServerError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
