//! `serve` sub-command — a tiny HTTP surface around the dispatcher.
//!
//! `axum::Router`, a `Clone`-able `AppState`, `tower_http`'s CORS + request
//! tracing layers. This engine's operator surface is a dispatch trigger
//! and a trace feed, not a CRUD API, so it gets two routes rather than a
//! per-resource handler module per entity.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use broker::{BrokerAdapter, InMemoryBroker, InMemoryStorage, StorageAdapter};
use dispatch::{Dispatcher, DispatcherOutcome, DispatcherPayload, EngineDeps};
use fdr::FlowRegistry;
use trace::{RingSink, TraceEvent, TraceSink};

#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
    sink: Arc<RingSink>,
}

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    #[serde(default)]
    pub node_args: Value,
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub dispatcher_id: String,
    pub outcome: &'static str,
}

pub async fn serve(bind: &str, registry: FlowRegistry) -> Result<(), std::io::Error> {
    let broker: Arc<dyn BrokerAdapter> = Arc::new(InMemoryBroker::new());
    let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
    let sink = Arc::new(RingSink::new(4096));
    let trace_handle: Arc<dyn TraceSink> = sink.clone();
    let deps = EngineDeps::new(registry, broker, storage, trace_handle);
    let state = AppState { dispatcher: Arc::new(Dispatcher::new(deps)), sink };

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/dispatch/:flow_name", post(trigger_dispatch))
        .route("/trace", get(drain_trace))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await
}

async fn trigger_dispatch(
    Path(flow_name): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<DispatchRequest>>,
) -> Result<(StatusCode, Json<DispatchResponse>), StatusCode> {
    let node_args = body.map(|Json(b)| b.node_args).unwrap_or(Value::Null);
    let payload = DispatcherPayload::fresh(flow_name, node_args, None, None);
    let dispatcher_id = uuid::Uuid::new_v4().to_string();

    match state.dispatcher.wakeup(&dispatcher_id, payload).await {
        Ok(DispatcherOutcome::Rescheduled { .. }) => {
            Ok((StatusCode::ACCEPTED, Json(DispatchResponse { dispatcher_id, outcome: "rescheduled" })))
        }
        Ok(DispatcherOutcome::Success { .. }) => {
            Ok((StatusCode::OK, Json(DispatchResponse { dispatcher_id, outcome: "success" })))
        }
        Ok(DispatcherOutcome::FlowFailed { .. }) => {
            Ok((StatusCode::OK, Json(DispatchResponse { dispatcher_id, outcome: "flow_failed" })))
        }
        Err(dispatch::DispatcherError::ConfigError(_)) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn drain_trace(State(state): State<AppState>) -> Json<Vec<TraceEvent>> {
    Json(state.sink.drain())
}
