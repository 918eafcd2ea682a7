use market::MarketReport;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use poem::IntoResponse;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use super::ApiError;
use crate::config::VmSpec;
use crate::registry::SharedRegistry;
use crate::registry::VmEntry;
use crate::scheduler::EntityStatus;
use crate::scheduler::SharedMarket;
use crate::scheduler::SharedStatus;
use crate::ControllerError;

/// A registered VM with the last observation of each of its entities.
#[derive(Debug, Serialize)]
pub struct VmView {
    #[serde(flatten)]
    pub vm: VmEntry,
    pub entities: Vec<EntityStatus>,
}

/// Balances and diagnostics of the last market update
#[handler]
pub async fn get_market(market: Data<&SharedMarket>) -> Json<MarketReport> {
    Json(market.lock().expect("poisoned").report())
}

/// Zero every balance and diagnostic counter
#[handler]
pub async fn reset_market(market: Data<&SharedMarket>) -> Json<MarketReport> {
    let mut market = market.lock().expect("poisoned");
    market.reset();
    Json(market.report())
}

#[handler]
pub async fn list_vms(
    registry: Data<&SharedRegistry>,
    status: Data<&SharedStatus>,
) -> Json<Vec<VmView>> {
    let vms = registry.vms();
    let status = status.read().expect("poisoned");

    let views = vms
        .into_iter()
        .map(|vm| {
            let entities = status
                .values()
                .filter(|entity| entity.vm == vm.spec.name)
                .cloned()
                .collect();
            VmView { vm, entities }
        })
        .collect();
    Json(views)
}

/// Register a VM; it joins the market on the next tick
#[handler]
pub async fn register_vm(
    Json(spec): Json<VmSpec>,
    registry: Data<&SharedRegistry>,
) -> poem::Result<impl IntoResponse> {
    let name = spec.name.clone();
    registry.register(spec).map_err(|report| {
        warn!(vm = %name, "vm registration rejected: {report:?}");
        match report.current_context() {
            ControllerError::Discovery { .. } => ApiError::VmExists { name: name.clone() },
            other => ApiError::InvalidRequest {
                reason: other.to_string(),
            },
        }
    })?;

    let entry = registry
        .vms()
        .into_iter()
        .find(|vm| vm.spec.name == name)
        .ok_or_else(|| ApiError::ServerError {
            message: format!("vm {name} vanished after registration"),
        })?;

    info!(vm = %name, "vm registered through the API");
    Ok(Json(entry).with_status(StatusCode::CREATED))
}

/// Unregister a VM; its balance stays in the ledger
#[handler]
pub async fn unregister_vm(
    Path(name): Path<String>,
    registry: Data<&SharedRegistry>,
) -> poem::Result<StatusCode> {
    if !registry.unregister(&name) {
        return Err(ApiError::VmNotFound { name }.into());
    }
    info!(vm = %name, "vm unregistered through the API");
    Ok(StatusCode::NO_CONTENT)
}
