//! WebSocket handshake authentication

use crate::error::{Error, Result};
use axum::extract::Query;
use axum::http::{header, HeaderMap, Uri};
use std::collections::HashMap;
use subtle::ConstantTimeEq;

/// Decides whether a WebSocket upgrade may proceed
pub trait WebSocketAuth: Send + Sync {
    /// `Err(Error::Auth(reason))` rejects the connection
    fn validate(&self, uri: &Uri, headers: &HeaderMap) -> Result<()>;
}

/// No authentication
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl WebSocketAuth for AllowAll {
    fn validate(&self, _uri: &Uri, _headers: &HeaderMap) -> Result<()> {
        Ok(())
    }
}

/// Shared token, passed as `?token=` or `Authorization: Bearer`
#[derive(Debug, Clone)]
pub struct TokenAuth {
    token: String,
}

impl TokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    fn presented(uri: &Uri, headers: &HeaderMap) -> Option<String> {
        if let Some(bearer) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        {
            return Some(bearer.trim().to_string());
        }
        Query::<HashMap<String, String>>::try_from_uri(uri)
            .ok()
            .and_then(|Query(mut params)| params.remove("token"))
    }
}

impl WebSocketAuth for TokenAuth {
    fn validate(&self, uri: &Uri, headers: &HeaderMap) -> Result<()> {
        match Self::presented(uri, headers) {
            None => Err(Error::Auth("Missing token".to_string())),
            Some(token) if tokens_match(&token, &self.token) => Ok(()),
            Some(_) => Err(Error::Auth("Invalid token".to_string())),
        }
    }
}

fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}
