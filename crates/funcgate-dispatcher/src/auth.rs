//! Inbound authentication for every gateway route.

use crate::ApiError;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

#[derive(Clone, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    None,
    /// Requests must carry `Authorization: Token <secret>`.
    Token(String),
}

impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::None => f.write_str("None"),
            AuthMode::Token(_) => f.write_str("Token(<redacted>)"),
        }
    }
}

impl AuthMode {
    /// Build from the configured auth type name and optional token.
    pub fn from_config(kind: &str, token: Option<&str>) -> anyhow::Result<Self> {
        match kind.trim() {
            "" | "none" => Ok(AuthMode::None),
            "token" => {
                let token = token
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("token auth requires AUTH_TOKEN_TOKEN"))?;
                Ok(AuthMode::Token(token.to_string()))
            }
            other => anyhow::bail!("unsupported auth type {other:?} (expected none or token)"),
        }
    }

    pub fn check(&self, authorization: Option<&str>) -> bool {
        match self {
            AuthMode::None => true,
            AuthMode::Token(expected) => {
                presented_token(authorization).is_some_and(|token| token == expected)
            }
        }
    }
}

/// The first whitespace-delimited word after the `Token` scheme.
fn presented_token(authorization: Option<&str>) -> Option<&str> {
    let rest = authorization?.trim_start().strip_prefix("Token")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    rest.split_whitespace().next()
}

pub async fn require_auth(State(mode): State<Arc<AuthMode>>, req: Request, next: Next) -> Response {
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if mode.check(authorization) {
        return next.run(req).await;
    }

    tracing::info!(
        event = "funcgate.auth.rejected",
        path = %req.uri().path(),
        "rejected request with invalid token"
    );
    ApiError::unauthorized("invalid token").into_response()
}
