use error_stack::Report;
use poem::delete;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::handlers::get_market;
use super::handlers::list_vms;
use super::handlers::register_vm;
use super::handlers::reset_market;
use super::handlers::unregister_vm;
use super::ApiError;
use crate::registry::SharedRegistry;
use crate::scheduler::SharedMarket;
use crate::scheduler::SharedStatus;

/// Routes of the API with the shared state attached.
pub fn routes(registry: SharedRegistry, market: SharedMarket, status: SharedStatus) -> impl Endpoint {
    Route::new()
        .at("/api/v1/market", get(get_market))
        .at("/api/v1/market/reset", post(reset_market))
        .at("/api/v1/vms", get(list_vms).post(register_vm))
        .at("/api/v1/vms/:name", delete(unregister_vm))
        .data(registry)
        .data(market)
        .data(status)
        .with(Tracing)
}

/// HTTP API server for inspecting the market and managing VMs
pub struct ApiServer {
    registry: SharedRegistry,
    market: SharedMarket,
    status: SharedStatus,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(
        registry: SharedRegistry,
        market: SharedMarket,
        status: SharedStatus,
        listen_addr: String,
    ) -> Self {
        Self {
            registry,
            market,
            status,
            listen_addr,
        }
    }

    /// Start the API server, returning once `token` is cancelled
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = routes(self.registry, self.market, self.status);
        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = token.cancelled() => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}
