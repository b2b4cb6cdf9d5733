//! API utility functions
//!
//! Pure, stateless helpers for HTTP request processing, kept apart from the
//! handlers so they can be unit tested.

use axum::http::HeaderMap;

use crate::api::error::ApiError;

/// Header carrying the caller's owner id
pub const OWNER_HEADER: &str = "X-Vatproof-Owner";

/// Header carrying the admin token on `/admin` routes
pub const ADMIN_TOKEN_HEADER: &str = "X-Vatproof-Admin-Token";

/// Parses and validates Content-Type header for application/json
///
/// Accepts:
/// - `application/json`
/// - `application/json; charset=utf-8`
///
/// Rejects:
/// - `application/jsonp`
/// - `application/json-patch+json`
/// - `text/json`
/// - Malformed media types
pub fn parse_content_type(content_type: &str) -> Result<mime::Mime, ApiError> {
    let media_type: mime::Mime = content_type.parse().map_err(|_| {
        ApiError::InvalidPayload(format!("invalid Content-Type: {}", content_type))
    })?;

    if media_type.type_() != mime::APPLICATION || media_type.subtype() != mime::JSON {
        return Err(ApiError::InvalidPayload(format!(
            "Content-Type must be application/json, got: {}/{}",
            media_type.type_(),
            media_type.subtype()
        )));
    }

    Ok(media_type)
}

/// Validates that body size does not exceed the maximum allowed size
pub fn validate_body_size(data: &[u8], max_size: usize) -> Result<(), ApiError> {
    if data.len() > max_size {
        return Err(ApiError::PayloadTooLarge(data.len()));
    }
    Ok(())
}

/// Owner id from the request headers; required on every batch route
pub fn owner_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| ApiError::InvalidPayload(format!("{} header is required", OWNER_HEADER)))
}

/// Check the admin token against the configured one. Without a configured
/// token every admin call is refused.
pub fn require_admin(headers: &HeaderMap, expected: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Err(ApiError::Forbidden("admin API is disabled".into()));
    };
    let given = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim);
    match given {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(ApiError::Forbidden("invalid admin token".into())),
        None => Err(ApiError::Forbidden(format!(
            "{} header is required",
            ADMIN_TOKEN_HEADER
        ))),
    }
}

/// `Content-Disposition` value for an archive download
pub fn attachment_disposition(file_name: &str) -> String {
    let safe: String = file_name
        .chars()
        .map(|c| if c == '"' || c.is_control() { '_' } else { c })
        .collect();
    format!("attachment; filename=\"{}\"", safe)
}
