use std::net::SocketAddr;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use contact_identity_api::{ApiError, ErrorKind, IdentifyResponse, IdentityApi, StoreArgs};
use serde::Serialize;

const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: IdentityApi,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorDetail {
    kind: ErrorKind,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    error: ErrorDetail,
}

#[derive(Debug, Parser)]
#[command(name = "contact-identity-service")]
#[command(about = "HTTP service for contact identity resolution")]
struct Args {
    #[arg(long, env = "CONTACT_IDENTITY_BIND", default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    #[command(flatten)]
    store: StoreArgs,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self.error.kind {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::StoreUnavailable | ErrorKind::StoreFailure | ErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(self)).into_response()
    }
}

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        let kind = err.kind();
        if kind.is_client_error() {
            tracing::warn!(kind = kind.code(), error = %err, "identify request rejected");
        } else {
            tracing::error!(kind = kind.code(), error = %err, "identify request failed");
        }
        Self { error: ErrorDetail { kind, message: err.public_message() } }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/identify", post(identify))
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.store.load()?;
    tracing::info!(
        store = %config.redacted_descriptor(),
        bind = %args.bind,
        "starting contact identity service"
    );

    let api = IdentityApi::new(config);
    let bootstrap = api.clone();
    tokio::task::spawn_blocking(move || bootstrap.init_store()).await??;

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn identify(
    State(state): State<ServiceState>,
    body: Bytes,
) -> Result<Json<IdentifyResponse>, ServiceError> {
    let api = state.api;
    let response = tokio::task::spawn_blocking(move || api.identify_json(&body))
        .await
        .map_err(|err| ApiError::Internal(format!("identify task failed: {err}")))??;
    Ok(Json(response))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}
