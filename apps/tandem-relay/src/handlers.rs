use axum::{extract::State, Json};
use serde::Serialize;
use tandem_proto::IceServerList;

use crate::websocket::RelayState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
}

pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

/// The configured ICE servers, in the shape call clients fetch before
/// building a peer connection.
pub async fn ice_servers(State(state): State<RelayState>) -> Json<IceServerList> {
    Json(IceServerList {
        ice_servers: state.config.ice_servers.clone(),
    })
}
