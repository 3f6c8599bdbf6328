//! Verified-identity extractor.
//!
//! Authentication lives outside this crate. An upstream proxy (or the
//! embedding application) verifies credentials and forwards the result in
//! headers; this extractor trusts them. Callers without a verified
//! identity can still get a synthetic read-only one from a client token.

use axum::http::request::Parts;
use axum::{extract::FromRequestParts, http::HeaderMap};

use crate::error::Error;
use crate::registry::anonymous_identity;

pub const IDENTITY_HEADER: &str = "x-identity";
pub const DISPLAY_NAME_HEADER: &str = "x-display-name";
pub const CLIENT_TOKEN_HEADER: &str = "x-client-token";

#[derive(Debug, Clone)]
pub struct Identity {
    pub identity: String,
    pub display_name: Option<String>,
}

impl Identity {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        if let Some(identity) = header_str(headers, IDENTITY_HEADER) {
            return Some(Self {
                identity,
                display_name: header_str(headers, DISPLAY_NAME_HEADER),
            });
        }
        // Synthetic identity from a client token: stable per token, good
        // enough for read-only channels, no queue guarantee across restarts.
        header_str(headers, CLIENT_TOKEN_HEADER).map(|token| Self {
            identity: anonymous_identity(&token),
            display_name: None,
        })
    }

    pub fn is_anonymous(&self) -> bool {
        self.identity.starts_with("anon-")
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Identity::from_headers(&parts.headers).ok_or(Error::Unauthenticated)
    }
}
