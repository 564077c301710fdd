//! Request identity, API token check, and the pluggable authorizer.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tarn_core::{AccessRule, ApiConfig};
use tracing::debug;

use crate::ApiState;

pub const TOKEN_HEADER: &str = "x-tarn-token";
pub const USER_HEADER: &str = "x-tarn-user";
pub const GROUPS_HEADER: &str = "x-tarn-groups";

/// Decides whether a caller may perform `action` on `resource`.
pub trait Authorizer: Send + Sync {
    fn is_allowed(&self, user: &str, groups: &[String], action: &str, resource: &str) -> bool;
}

/// Used when no rules are configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_allowed(&self, _: &str, _: &[String], _: &str, _: &str) -> bool {
        true
    }
}

/// First matching rule wins; no match denies.
#[derive(Debug, Clone, Default)]
pub struct RuleAuthorizer {
    rules: Vec<AccessRule>,
}

impl RuleAuthorizer {
    pub fn new(rules: Vec<AccessRule>) -> Self {
        Self { rules }
    }
}

impl Authorizer for RuleAuthorizer {
    fn is_allowed(&self, user: &str, groups: &[String], action: &str, resource: &str) -> bool {
        let matched = self.rules.iter().find(|rule| {
            let principal = (rule.users.is_empty() && rule.groups.is_empty())
                || rule.users.iter().any(|u| pattern_matches(u, user))
                || rule
                    .groups
                    .iter()
                    .any(|g| groups.iter().any(|have| pattern_matches(g, have)));
            principal
                && any_or_empty(&rule.actions, action)
                && any_or_empty(&rule.resources, resource)
        });
        match matched {
            Some(rule) => rule.allow,
            None => {
                debug!(user, action, resource, "no access rule matched, denying");
                false
            }
        }
    }
}

fn any_or_empty(patterns: &[String], value: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| pattern_matches(p, value))
}

/// `*` matches anything; a trailing `*` matches by prefix.
fn pattern_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

/// [`AllowAll`] when no rules are configured.
pub fn authorizer_from_config(config: &ApiConfig) -> Arc<dyn Authorizer> {
    if config.rules.is_empty() {
        Arc::new(AllowAll)
    } else {
        Arc::new(RuleAuthorizer::new(config.rules.clone()))
    }
}

/// Caller identity taken from request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub groups: Vec<String>,
}

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let user = header(USER_HEADER).unwrap_or("anonymous").to_string();
        let groups = header(GROUPS_HEADER)
            .map(|g| {
                g.split(',')
                    .map(str::trim)
                    .filter(|g| !g.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Identity { user, groups })
    }
}

/// Rejects requests without the configured token (header or `?token=`).
pub async fn require_token(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.token.as_deref() else {
        return next.run(request).await;
    };

    let from_header = request
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    let from_query = request.uri().query().and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == "token")
            .map(|(_, v)| v)
    });

    if from_header == Some(expected) || from_query == Some(expected) {
        next.run(request).await
    } else {
        debug!(path = %request.uri().path(), "rejected request without valid token");
        (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
    }
}
