//! Admin HTTP surface: one POST route per service, dispatched by method
//! name, plus static serving of the screenshot trees.

pub mod frs;
pub mod lprs;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fp_domain::Error;
use serde_json::json;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/ping", get(|| async { StatusCode::OK }))
        .route("/frs/api/:method", post(frs::handle))
        .route("/lprs/api/:method", post(lprs::handle));

    // Static artifact trees; screenshot URLs are built from the configured
    // URL prefixes which point back here.
    if !state.config.frs.screenshots_path.is_empty() {
        router = router.nest_service(
            "/frs/screenshots",
            ServeDir::new(state.config.frs.screenshots_path.clone()),
        );
    }
    if !state.config.lprs.screenshots_path.is_empty() {
        router = router.nest_service(
            "/lprs",
            ServeDir::new(state.config.lprs.screenshots_path.clone()),
        );
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(32 * 1024 * 1024))
        .with_state(state)
}

/// Bearer token from the Authorization header, if well-formed.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Wrap success-with-content as `{code, message, data}`; a `None` payload
/// becomes 204.
pub fn wrap(data: Option<serde_json::Value>, message: &str) -> Response {
    match data {
        Some(data) => (
            StatusCode::OK,
            Json(json!({
                "code": StatusCode::OK.as_u16().to_string(),
                "message": message,
                "data": data,
            })),
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            Error::Unauthorized => StatusCode::UNAUTHORIZED.into_response(),
            Error::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"externalBody": message})),
            )
                .into_response(),
            Error::NotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({"externalBody": "Unknown API method"})),
            )
                .into_response(),
            other => {
                tracing::error!(error = %other, "API handler failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request member validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn require_member(json: &serde_json::Value, member: &str) -> Result<(), Error> {
    let Some(value) = json.get(member) else {
        return Err(Error::bad_request(format!(
            "Required member `{member}` not found."
        )));
    };
    if value.is_null() {
        return Err(Error::bad_request(format!("Member `{member}` must not be null.")));
    }
    if value.is_array() {
        return Err(Error::bad_request(format!(
            "Member `{member}` must not be an array."
        )));
    }
    if value.is_object() {
        return Err(Error::bad_request(format!(
            "Member `{member}` must not be an object."
        )));
    }
    if value.as_str().map(|s| s.is_empty()).unwrap_or(false) {
        return Err(Error::bad_request(format!("Member `{member}` must not be empty.")));
    }
    Ok(())
}

pub fn require_array(json: &serde_json::Value, member: &str) -> Result<(), Error> {
    let Some(value) = json.get(member) else {
        return Err(Error::bad_request(format!(
            "Required array member `{member}` not found."
        )));
    };
    if value.is_null() {
        return Err(Error::bad_request(format!("Member `{member}` must not be null.")));
    }
    if value.is_object() {
        return Err(Error::bad_request(format!(
            "Member `{member}` must not be an object."
        )));
    }
    let Some(items) = value.as_array() else {
        return Err(Error::bad_request(format!("Member `{member}` must be an array.")));
    };
    if items.is_empty() {
        return Err(Error::bad_request(format!(
            "Array member `{member}` must not be empty."
        )));
    }
    Ok(())
}

pub fn int_array(json: &serde_json::Value, member: &str) -> Result<Vec<i32>, Error> {
    let items = json.get(member).and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let mut result = Vec::with_capacity(items.len());
    for item in items {
        match item.as_i64() {
            Some(value) => result.push(value as i32),
            None => {
                return Err(Error::bad_request(format!(
                    "Member `{member}` must contain integers."
                )))
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn member_validation_messages() {
        let body = json!({"a": null, "b": [], "c": {}, "d": "", "e": "ok"});
        assert!(require_member(&body, "missing")
            .unwrap_err()
            .to_string()
            .contains("not found"));
        assert!(require_member(&body, "a").unwrap_err().to_string().contains("null"));
        assert!(require_member(&body, "b").unwrap_err().to_string().contains("array"));
        assert!(require_member(&body, "c").unwrap_err().to_string().contains("object"));
        assert!(require_member(&body, "d").unwrap_err().to_string().contains("empty"));
        assert!(require_member(&body, "e").is_ok());
    }

    #[test]
    fn array_validation() {
        let body = json!({"faces": [1, 2], "empty": [], "scalar": 5});
        assert!(require_array(&body, "faces").is_ok());
        assert!(require_array(&body, "empty").unwrap_err().to_string().contains("empty"));
        assert!(require_array(&body, "scalar")
            .unwrap_err()
            .to_string()
            .contains("must be an array"));
        assert_eq!(int_array(&body, "faces").unwrap(), vec![1, 2]);
        assert!(int_array(&json!({"faces": ["x"]}), "faces").is_err());
    }
}
