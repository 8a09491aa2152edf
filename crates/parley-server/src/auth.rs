//! Handshake identity verification.
//!
//! Clients present an HS256 access token either as a `token` query parameter
//! or as an `Authorization: Bearer` header. The token's `sub` claim is the
//! user id attached to the connection.

use crate::config::AuthConfig;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Verifies access tokens.
pub struct Authenticator {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl Authenticator {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = ["sub".to_string()].into_iter().collect();
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }

        Self {
            key: config
                .jwt_secret
                .as_deref()
                .map(|secret| DecodingKey::from_secret(secret.as_bytes())),
            validation,
        }
    }

    /// Whether a secret is configured. Without one every token is rejected.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    /// Return the verified user id, or `None` if the token is missing or invalid.
    #[must_use]
    pub fn verify(&self, token: Option<&str>) -> Option<String> {
        let key = self.key.as_ref()?;
        let token = token?;
        match decode::<Claims>(token, key, &self.validation) {
            Ok(data) => Some(data.claims.sub),
            Err(e) => {
                debug!(error = %e, "Token rejected");
                None
            }
        }
    }
}

/// Extract the handshake token from the query string or headers.
pub fn handshake_token<'a>(
    query: &'a HashMap<String, String>,
    headers: &'a HeaderMap,
) -> Option<&'a str> {
    if let Some(token) = query.get("token").filter(|t| !t.is_empty()) {
        return Some(token.as_str());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        iss: Option<&'a str>,
        exp: u64,
    }

    fn token(secret: &str, sub: &str, iss: Option<&str>, exp: u64) -> String {
        encode(
            &Header::default(),
            &TestClaims { sub, iss, exp },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn far_future() -> u64 {
        4_102_444_800 // 2100-01-01
    }

    fn authenticator(issuer: Option<&str>) -> Authenticator {
        Authenticator::new(&AuthConfig {
            jwt_secret: Some("s3cret".into()),
            issuer: issuer.map(str::to_string),
        })
    }

    #[test]
    fn test_verify_accepts_valid_token() {
        let auth = authenticator(None);
        let t = token("s3cret", "alice", None, far_future());
        assert_eq!(auth.verify(Some(&t)).as_deref(), Some("alice"));
    }

    #[test]
    fn test_verify_rejects_bad_tokens() {
        let auth = authenticator(None);
        assert!(auth.verify(None).is_none());
        assert!(auth.verify(Some("garbage")).is_none());
        assert!(auth
            .verify(Some(&token("other", "alice", None, far_future())))
            .is_none());
        assert!(auth.verify(Some(&token("s3cret", "alice", None, 1))).is_none());
    }

    #[test]
    fn test_verify_checks_issuer() {
        let auth = authenticator(Some("parley"));
        assert!(auth
            .verify(Some(&token("s3cret", "alice", None, far_future())))
            .is_none());
        assert_eq!(
            auth.verify(Some(&token("s3cret", "alice", Some("parley"), far_future())))
                .as_deref(),
            Some("alice")
        );
    }

    #[test]
    fn test_unconfigured_rejects_everything() {
        let auth = Authenticator::new(&AuthConfig::default());
        assert!(!auth.is_configured());
        let t = token("s3cret", "alice", None, far_future());
        assert!(auth.verify(Some(&t)).is_none());
    }

    #[test]
    fn test_handshake_token_sources() {
        let mut query = HashMap::new();
        let mut headers = HeaderMap::new();
        assert!(handshake_token(&query, &headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(handshake_token(&query, &headers), Some("abc"));

        query.insert("token".to_string(), "xyz".to_string());
        assert_eq!(handshake_token(&query, &headers), Some("xyz"));
    }
}
