use anyhow::Context;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::manager::{ClusterHealth, HealthSummary};
use crate::metrics::MetricsSnapshot;
use crate::state::AppState;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct HealthResponse {
    clusters: Vec<ClusterHealth>,
    summary: HealthSummary,
    pipeline: MetricsSnapshot,
}

/// Read-only health surface: one JSON endpoint, nothing else. Unmatched
/// methods on the path get a 405 from the method router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/clusters", get(clusters_handler))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

async fn clusters_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.manager.health_snapshot();
    Json(HealthResponse {
        clusters: snapshot.clusters,
        summary: snapshot.summary,
        pipeline: state.metrics.snapshot(),
    })
}

/// Serve the health surface until `shutdown` flips. The caller keeps
/// this as the last component to stop so operators can watch the
/// drain finish.
pub async fn serve(state: AppState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let port = state.config.health.port;
    let addr: SocketAddr = format!("{}:{}", state.config.health.bind_address, port)
        .parse()
        .context("Invalid health bind address")?;

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind health endpoint")?;
    info!("Health endpoint listening on http://{addr}/health/clusters");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("Health server error")?;

    info!("Health endpoint closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterEntry, NightcrierConfig, ProbeConfig, SubscriptionMode, TriageConfig};
    use crate::manager::ConnectionManager;
    use crate::metrics::PipelineMetrics;
    use crate::registry::ClusterRegistry;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let entries = vec![ClusterEntry {
            name: "prod-east".to_string(),
            endpoint: "https://monitor.example.com".to_string(),
            auth_token: None,
            subscription_mode: SubscriptionMode::Faults,
            credential_path: None,
            triage: TriageConfig { enabled: false },
            labels: [("region".to_string(), "us-east".to_string())]
                .into_iter()
                .collect(),
        }];
        let registry = Arc::new(ClusterRegistry::from_entries(&entries).unwrap());
        let manager = Arc::new(
            ConnectionManager::new(
                registry,
                ProbeConfig {
                    kubectl_path: "kubectl".into(),
                    timeout_seconds: 1,
                    fail_cluster_on_error: false,
                },
                16,
            )
            .unwrap(),
        );
        AppState::new(
            Arc::new(NightcrierConfig::default()),
            manager,
            PipelineMetrics::new(),
        )
    }

    #[tokio::test]
    async fn test_get_health_clusters() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health/clusters")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "application/json"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["summary"]["total"], 1);
        assert_eq!(parsed["clusters"][0]["name"], "prod-east");
        assert_eq!(parsed["clusters"][0]["status"], "disconnected");
        assert_eq!(parsed["clusters"][0]["labels"]["region"], "us-east");
        assert!(parsed["pipeline"]["events_received"].is_u64());
    }

    #[tokio::test]
    async fn test_wrong_method_is_405() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/health/clusters")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
