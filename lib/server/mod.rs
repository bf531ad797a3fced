pub mod monitoring;
use crate::health::HealthVerdict;
use crate::state::AppState;
use prometheus_client::encoding::text::encode;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use monitoring::{HEALTH_METRICS, SYNC_METRICS};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::error;

/// 200 when every domain is healthy (or before the first health tick), 503 otherwise.
fn health_response(verdict: HealthVerdict) -> (StatusCode, Json<HealthVerdict>) {
    let status = if verdict.all_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(verdict))
}

async fn health_handler(state: State<Arc<AppState>>) -> (StatusCode, Json<HealthVerdict>) {
    health_response(state.health.current().await)
}

async fn expose_metrics(state: State<Arc<AppState>>) -> Result<String, StatusCode> {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    encode(&mut buffer, &registry).map_err(|err| {
        error!(event = "metrics_encode_failed", error = %err, "failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(buffer)
}

/// Registers metric families once per process.
pub async fn register_metrics(state: &AppState) {
    let mut registry = state.registry.write().await;

    SYNC_METRICS
        .get_or_init(|| async { monitoring::SyncMetrics::register(&mut registry, "sync") })
        .await;

    HEALTH_METRICS
        .get_or_init(|| async { monitoring::HealthMetrics::register(&mut registry, "health") })
        .await;

    monitoring::register_build_info_metric(&mut registry, "worker");
}

/// Starts the health/metrics HTTP server on the supplied socket address.
pub async fn setup_server_with_addr(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    register_metrics(&state).await;

    let shutdown_token = state.shutdown_token.clone();
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_handle = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await;

        if let Err(err) = served {
            error!(event = "http_server_failed", error = %err, "metrics server exited");
        }
    });

    Ok(server_handle)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use chrono::Utc;

    use super::health_response;
    use crate::domain::Domain;
    use crate::health::{HealthReason, HealthRecord, HealthVerdict};

    fn record(domain: Domain, is_healthy: bool, reason: HealthReason) -> HealthRecord {
        HealthRecord {
            timestamp: Utc::now(),
            domain,
            is_healthy,
            reason,
        }
    }

    #[test]
    fn empty_verdict_is_ok() {
        let (status, _) = health_response(HealthVerdict::default());
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn any_unhealthy_domain_is_unavailable() {
        let verdict = HealthVerdict {
            evaluated_at: Some(Utc::now()),
            node: None,
            records: vec![
                record(Domain::BlockSigners, true, HealthReason::None),
                record(Domain::Segments, false, HealthReason::MissingStatusFromService),
            ],
        };

        let (status, body) = health_response(verdict);
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let json = serde_json::to_value(&body.0).unwrap();
        assert_eq!(json["records"][1]["domain"], "segments");
        assert_eq!(json["records"][1]["reason"], "missingStatusFromService");
    }
}
