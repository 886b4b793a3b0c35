//! HTTP basic auth for every broker route.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::warn;

/// The one username/password pair the platform authenticates with.
///
/// Only digests are kept, so comparisons run over fixed-length values.
#[derive(Clone)]
pub struct BasicCredentials {
    username: [u8; 32],
    password: [u8; 32],
}

impl BasicCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: digest(username),
            password: digest(password),
        }
    }

    pub fn matches(&self, username: &str, password: &str) -> bool {
        // Both halves are evaluated before combining.
        let user_ok = self.username[..].ct_eq(&digest(username)[..]);
        let pass_ok = self.password[..].ct_eq(&digest(password)[..]);
        (user_ok & pass_ok).into()
    }
}

fn digest(value: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(value.as_bytes()));
    out
}

/// Decode an `Authorization: Basic ...` header into username and password.
pub fn parse_basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (username, password) = credentials.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"keybroker\"")],
        Json(serde_json::json!({ "description": "not authorized" })),
    )
        .into_response()
}

pub async fn require_basic_auth(
    State(credentials): State<Arc<BasicCredentials>>,
    req: Request,
    next: Next,
) -> Response {
    match parse_basic_auth(req.headers()) {
        Some((username, password)) if credentials.matches(&username, &password) => {
            next.run(req).await
        }
        Some((username, _)) => {
            warn!(%username, path = %req.uri().path(), "rejected broker credentials");
            unauthorized()
        }
        None => unauthorized(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn parses_basic_header() {
        // "admin:s3cr:et" — only the first colon separates.
        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:s3cr:et");
        let parsed = parse_basic_auth(&headers_with(&format!("Basic {encoded}")));
        assert_eq!(parsed, Some(("admin".to_string(), "s3cr:et".to_string())));
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        assert_eq!(parse_basic_auth(&HeaderMap::new()), None);
        assert_eq!(parse_basic_auth(&headers_with("Bearer abc")), None);
        assert_eq!(parse_basic_auth(&headers_with("Basic !!!")), None);

        let no_colon = base64::engine::general_purpose::STANDARD.encode("admin");
        assert_eq!(parse_basic_auth(&headers_with(&format!("Basic {no_colon}"))), None);
    }

    #[test]
    fn credentials_match_exactly() {
        let creds = BasicCredentials::new("admin", "secret");
        assert!(creds.matches("admin", "secret"));
        assert!(!creds.matches("admin", "Secret"));
        assert!(!creds.matches("root", "secret"));
        assert!(!creds.matches("", ""));
    }

    #[test]
    fn credentials_reject_prefixes_and_extensions() {
        let creds = BasicCredentials::new("admin", "secret");
        assert!(!creds.matches("admin", "secre"));
        assert!(!creds.matches("admin", "secret "));
        assert!(!creds.matches("admin", "secrex"));
        assert!(!creds.matches("admi", "secret"));
        assert!(!creds.matches("admin:secret", ""));
        // One wrong half is enough.
        assert!(!creds.matches("root", "wrong"));
    }
}
