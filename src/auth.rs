use crate::error::{AppError, AppResult};
use crate::users::{User, UserStore};
use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;

/// Quota floor below which finite-quota users are rejected.
const QUOTA_CUTOFF: f64 = 0.1;

/// Pull the API key out of the request. Accepted carriers:
/// `Authorization: Bearer <k>`, `X-API-Key: <k>`, `token: <k>`.
pub fn extract_api_key(headers: &HeaderMap) -> String {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let lower = auth.to_ascii_lowercase();
        if lower.starts_with("bearer ") {
            let key = auth[7..].trim();
            if !key.is_empty() {
                return key.to_string();
            }
        }
    }
    if let Some(key) = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return key.to_string();
    }
    if let Some(key) = headers
        .get("token")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return key.to_string();
    }
    String::new()
}

/// Identify the caller. The configured admin key always wins and grants an
/// unlimited admin identity; anything else indexes into the user table.
/// An empty admin key with an empty user table effectively disables auth
/// (development setups).
pub async fn authenticate(
    headers: &HeaderMap,
    admin_api_key: &str,
    users: &UserStore,
) -> AppResult<Option<User>> {
    let admin_key = admin_api_key.trim();
    let provided = extract_api_key(headers);

    if provided.is_empty() {
        if admin_key.is_empty() {
            return Ok(None);
        }
        return Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "unauthorized",
        ));
    }

    if !admin_key.is_empty() && provided == admin_key {
        return Ok(Some(User::admin(admin_key)));
    }

    let user = users
        .get_by_api_key(&provided)
        .await
        .map_err(|e| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "api_error", e))?
        .ok_or_else(|| {
            AppError::new(
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "unauthorized",
            )
        })?;

    if let Some(expire_at) = user.expire_at {
        if Utc::now() > expire_at {
            return Err(AppError::new(
                StatusCode::FORBIDDEN,
                "authentication_error",
                "api key expired",
            ));
        }
    }
    if !user.quota_unlimited() && user.quota <= QUOTA_CUTOFF {
        return Err(AppError::new(
            StatusCode::FORBIDDEN,
            "authentication_error",
            "quota exceeded",
        ));
    }

    Ok(Some(user))
}

pub fn require_admin(user: Option<&User>) -> AppResult<()> {
    match user {
        Some(u) if u.is_admin => Ok(()),
        _ => Err(AppError::new(
            StatusCode::FORBIDDEN,
            "permission_denied",
            "admin required",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extracts_key_from_all_carriers() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_api_key(&headers), "abc");

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("xyz"));
        assert_eq!(extract_api_key(&headers), "xyz");

        let mut headers = HeaderMap::new();
        headers.insert("token", HeaderValue::from_static("tok"));
        assert_eq!(extract_api_key(&headers), "tok");

        let headers = HeaderMap::new();
        assert_eq!(extract_api_key(&headers), "");
    }

    #[test]
    fn bearer_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("bearer abc"));
        assert_eq!(extract_api_key(&headers), "abc");
    }
}
