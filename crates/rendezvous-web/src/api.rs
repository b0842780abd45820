//! REST API route handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use rendezvous_broker::RelationStats;

use crate::state::AppState;

// ---------------------------------------------------------------------------
// GET /api/status
// ---------------------------------------------------------------------------

/// Response payload for the `/api/status` endpoint.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub open_connections: usize,
    pub relations: Vec<RelationStats>,
}

/// Report broker occupancy.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let stats = state.broker.stats();

    Json(StatusResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        open_connections: stats.open_connections,
        relations: stats.relations,
    })
}

#[cfg(test)]
mod tests {
    use rendezvous_broker::{Broker, BrokerConfig};

    use super::*;
    use crate::WebConfig;

    #[tokio::test]
    async fn status_counts_open_sessions() {
        let broker = Broker::new(BrokerConfig::default());
        let state = Arc::new(AppState::new(broker.clone(), WebConfig::default()));
        let _target = broker.open_target_session();

        let Json(body) = status(State(state)).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.open_connections, 1);
        assert_eq!(body.relations.len(), 2);
    }
}
