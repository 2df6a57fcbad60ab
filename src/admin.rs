use crate::app::AppState;
use crate::auth;
use crate::backends::{Backend, Combo};
use crate::error::{AppError, AppResult};
use crate::users::User;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/models", get(list_backends).post(create_backend))
        .route(
            "/models/{id}",
            get(get_backend).put(update_backend).delete(delete_backend),
        )
        .route("/combos", get(list_combos).post(create_combo))
        .route(
            "/combos/{id}",
            get(get_combo).put(update_combo).delete(delete_combo),
        )
        .route("/users", get(list_users).post(create_user))
        .route(
            "/users/{username}",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route("/usage-logs", get(list_usage_logs))
        .route("/error-logs", get(list_error_logs))
}

async fn admin_caller(state: &AppState, headers: &HeaderMap) -> AppResult<User> {
    let user = auth::authenticate(headers, &state.config.auth.api_key, &state.users).await?;
    auth::require_admin(user.as_ref())?;
    Ok(user.expect("admin user present"))
}

async fn caller(state: &AppState, headers: &HeaderMap) -> AppResult<User> {
    auth::authenticate(headers, &state.config.auth.api_key, &state.users)
        .await?
        .ok_or_else(|| {
            AppError::new(
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "unauthorized",
            )
        })
}

fn store_error(err: String) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "api_error", err)
}

async fn list_backends(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Response> {
    admin_caller(&state, &headers).await?;
    let backends = state.backends.list().await.map_err(store_error)?;
    Ok(Json(backends).into_response())
}

async fn get_backend(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Response> {
    admin_caller(&state, &headers).await?;
    let backend = state
        .backends
        .get(&id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| AppError::not_found(format!("Unknown model: {id}")))?;
    Ok(Json(backend).into_response())
}

async fn create_backend(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    admin_caller(&state, &headers).await?;
    let backend: Backend =
        serde_json::from_value(body).map_err(|err| AppError::invalid_request(err.to_string()))?;
    state.backends.upsert(&backend).await.map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(backend)).into_response())
}

async fn update_backend(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    admin_caller(&state, &headers).await?;
    let mut backend: Backend =
        serde_json::from_value(body).map_err(|err| AppError::invalid_request(err.to_string()))?;
    backend.id = id;
    state.backends.upsert(&backend).await.map_err(store_error)?;
    Ok(Json(backend).into_response())
}

async fn delete_backend(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Response> {
    admin_caller(&state, &headers).await?;
    if !state.backends.delete(&id).await.map_err(store_error)? {
        return Err(AppError::not_found(format!("Unknown model: {id}")));
    }
    Ok(Json(json!({ "deleted": id })).into_response())
}

async fn list_combos(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    admin_caller(&state, &headers).await?;
    let combos = state.backends.list_combos().await.map_err(store_error)?;
    Ok(Json(combos).into_response())
}

async fn get_combo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Response> {
    admin_caller(&state, &headers).await?;
    let combo = state
        .backends
        .get_combo(&id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| AppError::not_found(format!("Unknown combo: {id}")))?;
    Ok(Json(combo).into_response())
}

async fn create_combo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    admin_caller(&state, &headers).await?;
    let combo: Combo =
        serde_json::from_value(body).map_err(|err| AppError::invalid_request(err.to_string()))?;
    state.backends.upsert_combo(&combo).await.map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(combo)).into_response())
}

async fn update_combo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    admin_caller(&state, &headers).await?;
    let mut combo: Combo =
        serde_json::from_value(body).map_err(|err| AppError::invalid_request(err.to_string()))?;
    combo.id = id;
    state.backends.upsert_combo(&combo).await.map_err(store_error)?;
    Ok(Json(combo).into_response())
}

async fn delete_combo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Response> {
    admin_caller(&state, &headers).await?;
    if !state.backends.delete_combo(&id).await.map_err(store_error)? {
        return Err(AppError::not_found(format!("Unknown combo: {id}")));
    }
    Ok(Json(json!({ "deleted": id })).into_response())
}

#[derive(Debug, Deserialize)]
struct CreateUserBody {
    username: String,
    api_key: String,
    #[serde(default = "default_quota")]
    quota: f64,
    #[serde(default)]
    expire_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    is_admin: bool,
}

fn default_quota() -> f64 {
    -1.0
}

#[derive(Debug, Deserialize)]
struct UpdateUserBody {
    api_key: Option<String>,
    quota: Option<f64>,
    #[serde(default, with = "double_option")]
    expire_at: Option<Option<chrono::DateTime<chrono::Utc>>>,
    is_admin: Option<bool>,
}

/// Distinguish "field absent" from "field set to null" for expire_at.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<Option<Option<chrono::DateTime<chrono::Utc>>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<chrono::DateTime<chrono::Utc>>::deserialize(deserializer).map(Some)
    }
}

async fn list_users(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    admin_caller(&state, &headers).await?;
    let users = state.users.list().await.map_err(store_error)?;
    Ok(Json(users).into_response())
}

async fn get_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> AppResult<Response> {
    admin_caller(&state, &headers).await?;
    let user = state
        .users
        .get(&username)
        .await
        .map_err(store_error)?
        .ok_or_else(|| AppError::not_found(format!("Unknown user: {username}")))?;
    Ok(Json(user).into_response())
}

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateUserBody>,
) -> AppResult<Response> {
    admin_caller(&state, &headers).await?;
    let user = state
        .users
        .create(
            &body.username,
            &body.api_key,
            body.quota,
            body.expire_at,
            body.is_admin,
        )
        .await
        .map_err(|err| AppError::invalid_request(err))?;
    Ok((StatusCode::CREATED, Json(user)).into_response())
}

async fn update_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(username): Path<String>,
    Json(body): Json<UpdateUserBody>,
) -> AppResult<Response> {
    admin_caller(&state, &headers).await?;
    let updated = state
        .users
        .update(
            &username,
            body.api_key.as_deref(),
            body.quota,
            body.expire_at,
            body.is_admin,
        )
        .await
        .map_err(|err| AppError::invalid_request(err))?;
    if !updated {
        return Err(AppError::not_found(format!("Unknown user: {username}")));
    }
    Ok(Json(json!({ "updated": username })).into_response())
}

async fn delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> AppResult<Response> {
    admin_caller(&state, &headers).await?;
    if !state.users.delete(&username).await.map_err(store_error)? {
        return Err(AppError::not_found(format!("Unknown user: {username}")));
    }
    Ok(Json(json!({ "deleted": username })).into_response())
}

#[derive(Debug, Deserialize)]
struct UsageLogQuery {
    #[serde(default)]
    username: Option<String>,
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_page_size")]
    page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    50
}

async fn list_usage_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UsageLogQuery>,
) -> AppResult<Response> {
    let user = caller(&state, &headers).await?;
    // non-admin callers only see their own rows
    let username = match query.username {
        Some(requested) if user.is_admin => requested,
        Some(requested) if requested == user.username => requested,
        Some(_) => {
            return Err(AppError::new(
                StatusCode::FORBIDDEN,
                "permission_denied",
                "admin required",
            ));
        }
        None => user.username.clone(),
    };
    let (logs, total) = state
        .users
        .usage_logs_for(&username, query.page, query.page_size)
        .await
        .map_err(store_error)?;
    Ok(Json(json!({ "total": total, "logs": logs })).into_response())
}

#[derive(Debug, Deserialize)]
struct ErrorLogQuery {
    #[serde(default = "default_error_limit")]
    limit: i64,
}

fn default_error_limit() -> i64 {
    100
}

async fn list_error_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ErrorLogQuery>,
) -> AppResult<Response> {
    admin_caller(&state, &headers).await?;
    let logs = state
        .users
        .recent_error_logs(query.limit)
        .await
        .map_err(store_error)?;
    Ok(Json(logs).into_response())
}
