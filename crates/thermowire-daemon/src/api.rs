//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thermowire_core::{Address, BusId};
use thermowire_discovery::EngineError;
use tracing::{debug, info};

use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiError::new(msg))).into_response()
}

/// Map an engine failure to a status code
fn engine_error(e: EngineError) -> Response {
    let status = match &e {
        EngineError::NameInUse(_) | EngineError::DuplicateBus(_) => StatusCode::CONFLICT,
        EngineError::UnknownBus(_) => StatusCode::NOT_FOUND,
        EngineError::EmptyName | EngineError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
        EngineError::Registry(_) | EngineError::Worker(_) | EngineError::Task(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, e.to_string())
}

/// List all known devices
pub async fn list_devices(State(state): State<Arc<AppState>>) -> Response {
    match state.manager.list_devices().await {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => engine_error(e),
    }
}

/// Get a device by name
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.manager.get_device(&name).await {
        Ok(Some(device)) => Json(device).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Device not found"),
        Err(e) => engine_error(e),
    }
}

/// Name assignment request body
#[derive(Deserialize)]
pub struct AssignNameRequest {
    /// Address in any separator style, e.g. `28:FF:4C:7C:0B:16:04:A0`
    pub address: String,
}

/// Assign a name to an address, registering the device if it is unknown
pub async fn assign_name(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<AssignNameRequest>,
) -> Response {
    let address: Address = match req.address.parse() {
        Ok(address) => address,
        Err(e) => return engine_error(EngineError::InvalidAddress(e)),
    };

    info!(device = %name, address = %address, "Name assignment requested");

    if let Err(e) = state.manager.assign_name(&name, address).await {
        return engine_error(e);
    }
    match state.manager.get_device(name.trim()).await {
        Ok(Some(device)) => Json(device).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Device not found"),
        Err(e) => engine_error(e),
    }
}

/// Run a full reconciliation pass
pub async fn trigger_scan(State(state): State<Arc<AppState>>) -> Response {
    info!("Manual scan triggered");

    match state.manager.search_devices().await {
        Ok(devices) => Json(serde_json::json!({
            "status": "completed",
            "devices_found": devices.iter().filter(|d| d.live).count(),
            "total": devices.len()
        }))
        .into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Scan failed: {}", e),
        ),
    }
}

/// List registered buses
pub async fn list_buses(State(state): State<Arc<AppState>>) -> Response {
    match state.manager.buses().await {
        Ok(buses) => Json(buses).into_response(),
        Err(e) => engine_error(e),
    }
}

/// Bus registration request body
#[derive(Deserialize)]
pub struct AddBusRequest {
    pub id: u8,
}

pub async fn add_bus(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddBusRequest>,
) -> Response {
    info!(bus = req.id, "Add bus requested");

    match state.manager.add_bus(BusId(req.id)).await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "status": "added", "id": req.id })),
        )
            .into_response(),
        Err(e) => engine_error(e),
    }
}

pub async fn remove_bus(State(state): State<Arc<AppState>>, Path(id): Path<u8>) -> Response {
    info!(bus = id, "Remove bus requested");

    match state.manager.remove_bus(BusId(id)).await {
        Ok(()) => Json(serde_json::json!({ "status": "removed", "id": id })).into_response(),
        Err(e) => engine_error(e),
    }
}

/// Get the configuration the daemon was started with
pub async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.clone())
}

/// Poll interval in milliseconds, used for both reading and writing
#[derive(Serialize, Deserialize)]
pub struct PollInterval {
    pub poll_interval_ms: u64,
}

fn millis(period: Duration) -> u64 {
    u64::try_from(period.as_millis()).unwrap_or(u64::MAX)
}

pub async fn get_poll_interval(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(PollInterval {
        poll_interval_ms: millis(state.manager.poll_interval()),
    })
}

pub async fn set_poll_interval(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PollInterval>,
) -> Response {
    if req.poll_interval_ms == 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "poll_interval_ms must be greater than zero",
        );
    }
    debug!(period_ms = req.poll_interval_ms, "Updating poll interval");
    state
        .manager
        .set_poll_interval(Duration::from_millis(req.poll_interval_ms));
    Json(PollInterval {
        poll_interval_ms: millis(state.manager.poll_interval()),
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusConfig, Config};
    use axum::body::to_bytes;
    use thermowire_bus::{complete_address, SimulatedDevice};

    fn sensor(n: u8) -> Address {
        complete_address([0x28, n, 0, 0, 0, 0, 0x01])
    }

    async fn started_state() -> Arc<AppState> {
        let config = Config {
            buses: vec![BusConfig { id: 25 }],
            simulation: crate::config::SimulationConfig {
                devices: vec![SimulatedDevice {
                    bus: BusId(25),
                    address: sensor(1),
                    celsius: 21.5,
                    parasite: false,
                }],
            },
            ..Default::default()
        };
        let state = AppState::new(config).await.unwrap();
        state.start().await.unwrap();
        state
    }

    async fn json(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_list_and_rename() {
        let state = started_state().await;

        let response = list_devices(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let devices = json(response).await;
        assert_eq!(devices.as_array().unwrap().len(), 1);

        let response = assign_name(
            State(state.clone()),
            Path("boiler".to_string()),
            Json(AssignNameRequest {
                address: sensor(1).to_string(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let device = json(response).await;
        assert_eq!(device["name"], "boiler");
        assert_eq!(device["bus"], 25);

        let response = get_device(State(state.clone()), Path("missing".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        state.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_assign_name_errors() {
        let state = started_state().await;

        let response = assign_name(
            State(state.clone()),
            Path("x".to_string()),
            Json(AssignNameRequest {
                address: "28:FF".to_string(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        state
            .manager
            .assign_name("spare", sensor(2))
            .await
            .unwrap();
        let response = assign_name(
            State(state.clone()),
            Path("spare".to_string()),
            Json(AssignNameRequest {
                address: sensor(1).to_string(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        state.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bus_endpoints() {
        let state = started_state().await;

        let response = add_bus(State(state.clone()), Json(AddBusRequest { id: 25 })).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = add_bus(State(state.clone()), Json(AddBusRequest { id: 4 })).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = remove_bus(State(state.clone()), Path(99)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let buses = json(list_buses(State(state.clone())).await).await;
        assert_eq!(buses.as_array().unwrap().len(), 2);
        state.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_interval_endpoints() {
        let state = started_state().await;

        let response = set_poll_interval(
            State(state.clone()),
            Json(PollInterval {
                poll_interval_ms: 2500,
            }),
        )
        .await;
        assert_eq!(json(response).await["poll_interval_ms"], 2500);

        let response = set_poll_interval(
            State(state.clone()),
            Json(PollInterval {
                poll_interval_ms: 0,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.manager.poll_interval(), Duration::from_millis(2500));

        let response = set_poll_interval(
            State(state.clone()),
            Json(PollInterval {
                poll_interval_ms: u64::MAX,
            }),
        )
        .await;
        assert_eq!(json(response).await["poll_interval_ms"], u64::MAX);
        state.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_reports_counts() {
        let state = started_state().await;
        let body = json(trigger_scan(State(state.clone())).await).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["devices_found"], 1);
        state.stop().await.unwrap();
    }
}
