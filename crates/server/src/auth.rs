//! Admin token middleware for the diagnostics routes.
//!
//! When `--admin-token` is configured, every `/api/sessions` and
//! `/api/connection` request must carry `Authorization: Bearer <token>`
//! (or `?token=<token>`). Course, account and chat routes stay open.

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};

/// Axum middleware that checks for the admin token.
pub async fn admin_token_middleware(
    State(expected_token): State<String>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if request_token(&req).is_some_and(|token| token == expected_token) {
        return Ok(next.run(req).await);
    }

    tracing::debug!(
        component = "auth",
        event = "auth.rejected",
        path = %req.uri().path(),
        "Rejected diagnostics request without a valid admin token"
    );
    Err(StatusCode::UNAUTHORIZED)
}

fn request_token(req: &Request<Body>) -> Option<&str> {
    // Authorization header first
    let from_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if from_header.is_some() {
        return from_header;
    }

    req.uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn header_token_is_preferred() {
        let req = request("/api/sessions?token=query", Some("header"));
        assert_eq!(request_token(&req), Some("header"));
    }

    #[test]
    fn query_token_is_accepted() {
        let req = request("/api/sessions?idle_secs=5&token=abc", None);
        assert_eq!(request_token(&req), Some("abc"));
    }

    #[test]
    fn missing_token() {
        assert_eq!(request_token(&request("/api/sessions", None)), None);
    }
}
