use crate::backend_state::BackendState;
use crate::backends::BackendStore;
use crate::config::Config;
use crate::error::AppError;
use crate::operators::{self, OperatorRegistry};
use crate::ratelimit::QpsLimiter;
use crate::users::UserStore;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http: reqwest::Client,
    pub backends: BackendStore,
    pub users: UserStore,
    pub backend_state: BackendState,
    pub qps: QpsLimiter,
    pub operators: Arc<OperatorRegistry>,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

pub async fn load_state(config: Config) -> Result<AppState, AppError> {
    let http = reqwest::Client::builder()
        .user_agent("polyroute/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let dsn = config.database_dsn();
    ensure_sqlite_file(&dsn).map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "database_init_failed", err)
    })?;
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            dsn.parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| {
                    AppError::new(
                        StatusCode::BAD_REQUEST,
                        "database_dsn_parse_failed",
                        err.to_string(),
                    )
                })?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5)),
        )
        .await
        .map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "database_init_failed",
                err.to_string(),
            )
        })?;

    let backends = BackendStore::new(pool.clone()).await.map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "backend_store_init_failed", err)
    })?;
    let users = UserStore::new(pool).await.map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "user_store_init_failed", err)
    })?;

    let metrics = init_metrics()?;
    let backend_state = BackendState::new();
    crate::tasks::spawn_sweepers(backend_state.clone(), users.clone());

    Ok(AppState {
        config: Arc::new(config),
        http,
        backends,
        users,
        backend_state,
        qps: QpsLimiter::new(),
        operators: Arc::new(operators::registry()),
        metrics,
    })
}

fn init_metrics() -> Result<PrometheusHandle, AppError> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });
    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

pub fn build_app(state: AppState) -> Router {
    let prefix = state.config.route_prefix();
    let api = completion_router();
    Router::<AppState>::new()
        .merge(api.clone())
        .nest(&prefix, api)
        .nest("/api", crate::admin::router())
        .route("/healthz", get(crate::handlers::healthz))
        .route("/metrics", get(crate::handlers::metrics))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn completion_router() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/messages",
            post(crate::handlers::create_messages).options(crate::handlers::options_no_content),
        )
        .route(
            "/v1/messages/count_tokens",
            post(crate::handlers::count_tokens).options(crate::handlers::options_no_content),
        )
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions)
                .options(crate::handlers::options_no_content),
        )
        .route(
            "/v1/responses",
            post(crate::handlers::create_responses).options(crate::handlers::options_no_content),
        )
}
