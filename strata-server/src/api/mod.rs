//! HTTP API endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::Arc;
use strata_core::blocklist::{Blocklist, Poller, SnapshotSource, TenantPollStatus};
use strata_core::compaction::Compactor;
use strata_core::BlockMeta;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub blocklist: Arc<Blocklist>,
    pub poller: Arc<Poller>,
    pub compactor: Option<Arc<Compactor>>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ping", get(ping))

        // Blocklist read path
        .route("/tenants", get(tenants))
        .route("/blocklist/:tenant", get(blocklist))
        .route("/blocklist/:tenant/status", get(tenant_status))

        // Stats
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct BlocklistResponse {
    pub tenant: String,
    pub generation: u64,
    pub polled_at: DateTime<Utc>,
    pub source: SnapshotSource,
    pub metas: Vec<BlockMeta>,
    pub compacted_metas: Vec<BlockMeta>,
}

#[derive(Debug, Serialize)]
pub struct RangeResponse {
    pub tenant: String,
    pub generation: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub blocks: Vec<BlockMeta>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub tenant_count: usize,
    pub degraded_tenants: usize,
    pub total_blocks: usize,
    pub total_compacted_blocks: usize,
    pub total_bytes: u64,
    pub tenants: Vec<TenantStats>,
}

#[derive(Debug, Serialize)]
pub struct TenantStats {
    pub tenant: String,
    pub generation: u64,
    pub blocks: usize,
    pub compacted_blocks: usize,
    pub live_bytes: u64,
    pub compacted_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TenantPollStatus>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: error.into() }))
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: strata_core::VERSION.to_string(),
    })
}

async fn ping() -> &'static str {
    "pong"
}

async fn tenants(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.blocklist.tenants())
}

async fn blocklist(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let snapshot = state.blocklist.snapshot(&tenant);

    let body = match (params.start, params.end) {
        (None, None) => serde_json::to_value(BlocklistResponse {
            tenant,
            generation: snapshot.generation,
            polled_at: snapshot.polled_at,
            source: snapshot.source,
            metas: snapshot.metas.clone(),
            compacted_metas: snapshot.compacted_metas.clone(),
        }),
        (start, end) => {
            let start = start.unwrap_or(DateTime::<Utc>::MIN_UTC);
            let end = end.unwrap_or_else(Utc::now);
            if start > end {
                return Err(api_error(
                    StatusCode::BAD_REQUEST,
                    format!("start {} is after end {}", start, end),
                ));
            }
            // compacted blocks stay searchable while other views may still list them
            let lookback = state.poller.config().poll_interval * 2;
            serde_json::to_value(RangeResponse {
                tenant,
                generation: snapshot.generation,
                start,
                end,
                blocks: snapshot
                    .blocks_for_range(start, end, lookback)
                    .into_iter()
                    .cloned()
                    .collect(),
            })
        }
    };

    body.map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn tenant_status(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<Json<TenantPollStatus>, ApiError> {
    state.poller.status(&tenant).map(Json).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("tenant {} has not been polled", tenant),
        )
    })
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let statuses = state.poller.statuses();
    let mut response = StatsResponse {
        tenant_count: 0,
        degraded_tenants: statuses.values().filter(|s| s.is_degraded()).count(),
        total_blocks: 0,
        total_compacted_blocks: 0,
        total_bytes: 0,
        tenants: Vec::new(),
    };

    for tenant in state.blocklist.tenants() {
        let snapshot = state.blocklist.snapshot(&tenant);
        let totals = snapshot.totals();
        response.total_blocks += snapshot.metas.len();
        response.total_compacted_blocks += snapshot.compacted_metas.len();
        response.total_bytes += totals.live_bytes + totals.compacted_bytes;
        response.tenants.push(TenantStats {
            status: statuses.get(&tenant).cloned(),
            tenant,
            generation: snapshot.generation,
            blocks: snapshot.metas.len(),
            compacted_blocks: snapshot.compacted_metas.len(),
            live_bytes: totals.live_bytes,
            compacted_bytes: totals.compacted_bytes,
        });
    }
    response.tenant_count = response.tenants.len();

    Json(response)
}

async fn metrics(State(state): State<AppState>) -> String {
    let poller = state.poller.metrics().snapshot();
    let statuses = state.poller.statuses();

    // Prometheus format
    let mut output = String::new();
    counter(&mut output, "strata_blocklist_poll_cycles_total", "Completed poll cycles", poller.cycles);
    counter(
        &mut output,
        "strata_blocklist_poll_cycle_errors_total",
        "Poll cycles that failed to list tenants",
        poller.cycle_errors,
    );
    gauge(
        &mut output,
        "strata_blocklist_poll_duration_seconds",
        "Duration of the last poll cycle",
        poller.last_cycle_millis as f64 / 1000.0,
    );
    counter(
        &mut output,
        "strata_tenant_index_builds_total",
        "Tenant indexes built by this instance",
        poller.index_builds,
    );
    counter(
        &mut output,
        "strata_tenant_index_publish_errors_total",
        "Tenant index writes that failed",
        poller.index_publish_errors,
    );

    let tenants = &poller.tenants;
    per_tenant(
        &mut output,
        "strata_blocklist_poll_errors_total",
        "counter",
        "Failed tenant polls",
        tenants.iter().map(|(t, m)| (t, m.poll_errors)),
    );
    per_tenant(
        &mut output,
        "strata_tenant_index_errors_total",
        "counter",
        "Unusable tenant index fetches",
        tenants.iter().map(|(t, m)| (t, m.index_errors)),
    );
    per_tenant(
        &mut output,
        "strata_blocklist_poll_fallbacks_total",
        "counter",
        "Full scans after an unusable index",
        tenants.iter().map(|(t, m)| (t, m.fallbacks)),
    );
    per_tenant(
        &mut output,
        "strata_blocklist_length",
        "gauge",
        "Live blocks in the blocklist",
        tenants.iter().map(|(t, m)| (t, m.blocklist_length)),
    );
    per_tenant(
        &mut output,
        "strata_tenant_index_age_seconds",
        "gauge",
        "Age of the last accepted tenant index",
        tenants.iter().filter_map(|(t, m)| m.index_age_seconds.map(|age| (t, age))),
    );
    per_tenant(
        &mut output,
        "strata_blocklist_degraded",
        "gauge",
        "Whether the tenant is serving a stale blocklist",
        statuses.iter().map(|(t, s)| (t, s.is_degraded() as u64)),
    );

    let _ = writeln!(output, "# HELP strata_backend_objects Objects in the backend");
    let _ = writeln!(output, "# TYPE strata_backend_objects gauge");
    for (tenant, m) in tenants {
        let _ = writeln!(output, "strata_backend_objects{{tenant=\"{}\",status=\"live\"}} {}", tenant, m.live_objects);
        let _ = writeln!(output, "strata_backend_objects{{tenant=\"{}\",status=\"compacted\"}} {}", tenant, m.compacted_objects);
    }
    let _ = writeln!(output, "# HELP strata_backend_bytes Bytes in the backend");
    let _ = writeln!(output, "# TYPE strata_backend_bytes gauge");
    for (tenant, m) in tenants {
        let _ = writeln!(output, "strata_backend_bytes{{tenant=\"{}\",status=\"live\"}} {}", tenant, m.live_bytes);
        let _ = writeln!(output, "strata_backend_bytes{{tenant=\"{}\",status=\"compacted\"}} {}", tenant, m.compacted_bytes);
    }

    if let Some(compactor) = &state.compactor {
        let c = compactor.metrics().snapshot();
        counter(&mut output, "strata_compactions_total", "Compaction jobs completed", c.compactions);
        counter(
            &mut output,
            "strata_compaction_errors_total",
            "Compaction jobs that failed",
            c.compaction_errors,
        );
        counter(
            &mut output,
            "strata_compaction_blocks_total",
            "Input blocks retired by compaction",
            c.blocks_compacted,
        );
        counter(
            &mut output,
            "strata_compaction_ownership_lost_total",
            "Jobs abandoned after losing ownership",
            c.ownership_lost,
        );
        counter(
            &mut output,
            "strata_retention_marked_total",
            "Blocks retired by retention",
            c.retention_marked,
        );
        counter(
            &mut output,
            "strata_retention_cleared_total",
            "Compacted blocks deleted by retention",
            c.retention_cleared,
        );
    }

    output
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} counter", name);
    let _ = writeln!(output, "{} {}", name, value);
}

fn per_tenant<'a>(
    output: &mut String,
    name: &str,
    kind: &str,
    help: &str,
    values: impl Iterator<Item = (&'a String, u64)>,
) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} {}", name, kind);
    for (tenant, value) in values {
        let _ = writeln!(output, "{}{{tenant=\"{}\"}} {}", name, tenant, value);
    }
}

fn gauge(output: &mut String, name: &str, help: &str, value: f64) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} gauge", name);
    let _ = writeln!(output, "{} {}", name, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use strata_core::backend::{Backend, MemoryStore};
    use strata_core::blocklist::PollerConfig;
    use strata_core::index::OwnsNothingSharder;
    use strata_core::BlockVersion;
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn app() -> (Router, Arc<Blocklist>) {
        let store = Arc::new(MemoryStore::new());
        let backend = Backend::new(store, Duration::from_secs(5));
        let now = Utc::now();
        for i in 1..=3u128 {
            let end = now - chrono::Duration::hours(i as i64 - 1);
            let meta = BlockMeta::new("t1", Uuid::from_u128(i), BlockVersion::VParquet4)
                .with_time_range(end - chrono::Duration::hours(1), end)
                .with_objects(10, 1000);
            backend.write_block_meta(&meta).await.unwrap();
        }

        let blocklist = Arc::new(Blocklist::new());
        let poller = Arc::new(Poller::new(
            PollerConfig::default(),
            backend,
            blocklist.clone(),
            Arc::new(OwnsNothingSharder),
        ));
        poller.poll_cycle().await.unwrap();

        let router = create_router(AppState {
            blocklist: blocklist.clone(),
            poller,
            compactor: None,
        });
        (router, blocklist)
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _) = app().await;
        let (status, body) = get(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_blocklist_snapshot() {
        let (router, _) = app().await;
        let (status, body) = get(router.clone(), "/blocklist/t1").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["metas"].as_array().unwrap().len(), 3);
        assert_eq!(json["source"], "full_scan");

        // unknown tenants get an empty snapshot
        let (status, body) = get(router, "/blocklist/nobody").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["generation"], 0);
        assert!(json["metas"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocklist_range() {
        let (router, _) = app().await;
        let start = (Utc::now() - chrono::Duration::minutes(90)).format("%Y-%m-%dT%H:%M:%SZ");
        let (status, body) = get(router.clone(), &format!("/blocklist/t1?start={}", start)).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        // blocks ending within the last 90 minutes
        assert_eq!(json["blocks"].as_array().unwrap().len(), 2);

        let (status, _) = get(
            router,
            "/blocklist/t1?start=2024-01-02T00:00:00Z&end=2024-01-01T00:00:00Z",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_and_stats() {
        let (router, _) = app().await;
        let (status, body) = get(router.clone(), "/blocklist/t1/status").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["state"], "full_scan");

        let (status, _) = get(router.clone(), "/blocklist/nobody/status").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = get(router, "/stats").await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["tenant_count"], 1);
        assert_eq!(json["total_blocks"], 3);
        assert_eq!(json["total_bytes"], 3000);
    }

    #[tokio::test]
    async fn test_metrics() {
        let (router, _) = app().await;
        let (status, body) = get(router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("strata_blocklist_poll_cycles_total 1"));
        assert!(text.contains("strata_blocklist_length{tenant=\"t1\"} 3"));
        assert!(text.contains("strata_backend_bytes{tenant=\"t1\",status=\"live\"} 3000"));
    }
}
