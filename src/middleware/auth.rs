//! `auth`: credential check and tag assignment.
//!
//! # Responsibilities
//! - Read a credential from `Authorization: Bearer`, `x-api-key`, or (for
//!   stream connections) the `token` query parameter
//! - Attach the caller's `AuthTags` to the context for the router
//! - Refuse connections that present an unknown credential
//!
//! # Design Decisions
//! - No credential is not a failure: the caller stays anonymous and the
//!   router decides whether the route needs tags
//! - Refusals are sent from here rather than raised, so outer stages
//!   (cors, logging) still see the response

use std::collections::HashMap;

use axum::http::StatusCode;
use futures_util::future::BoxFuture;
use serde::Deserialize;

use crate::error::Result;
use crate::http::{Response, WebSocket};
use crate::middleware::{MiddlewareFactory, MiddlewareKind};
use crate::protocol::{
    App, AuthTags, ConnectionContext, ConnectionKind, HeaderList, Inbound, Outbound,
};

const API_KEY_HEADER: &str = "x-api-key";
const TOKEN_QUERY_PARAM: &str = "token";

/// What a known token grants.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenGrant {
    /// Identity for logging; defaults to the token's table key.
    pub principal: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthOptions {
    /// Token → grant.
    pub tokens: HashMap<String, TokenGrant>,
    /// Tags given to callers without a credential.
    pub anonymous_tags: Vec<String>,
    pub realm: String,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            tokens: HashMap::new(),
            anonymous_tags: Vec::new(),
            realm: "switchyard".to_string(),
        }
    }
}

/// Outcome of inspecting a connection's credential.
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Anonymous,
    Granted(AuthTags),
    Refused,
}

pub struct AuthMiddleware {
    inner: Box<dyn App>,
    options: AuthOptions,
}

impl AuthMiddleware {
    pub fn new(inner: Box<dyn App>, options: AuthOptions) -> Self {
        Self { inner, options }
    }

    fn credential(ctx: &ConnectionContext) -> Option<String> {
        if let Some(value) = ctx.header("authorization") {
            let mut parts = value.splitn(2, ' ');
            let scheme = parts.next().unwrap_or("");
            if scheme.eq_ignore_ascii_case("bearer") {
                return parts.next().map(|token| token.trim().to_string());
            }
        }
        if let Some(key) = ctx.header(API_KEY_HEADER) {
            return Some(key.trim().to_string());
        }
        if ctx.kind == ConnectionKind::WebSocket {
            return ctx.query().first(TOKEN_QUERY_PARAM).map(str::to_string);
        }
        None
    }

    fn inspect(&self, ctx: &ConnectionContext) -> Verdict {
        match Self::credential(ctx) {
            None => Verdict::Anonymous,
            Some(token) => match self.options.tokens.get(&token) {
                Some(grant) => Verdict::Granted(AuthTags {
                    principal: Some(grant.principal.clone().unwrap_or(token)),
                    tags: grant.tags.clone(),
                }),
                None => Verdict::Refused,
            },
        }
    }

    fn challenge(&self) -> HeaderList {
        let mut headers = HeaderList::new();
        headers.set(
            "www-authenticate",
            format!("Bearer realm=\"{}\"", self.options.realm),
        );
        headers
    }
}

impl App for AuthMiddleware {
    fn call<'a>(
        &'a self,
        mut ctx: ConnectionContext,
        inbound: &'a mut dyn Inbound,
        outbound: &'a mut dyn Outbound,
    ) -> BoxFuture<'a, Result<()>> {
        if ctx.kind == ConnectionKind::Lifespan {
            return self.inner.call(ctx, inbound, outbound);
        }

        match self.inspect(&ctx) {
            Verdict::Granted(tags) => {
                tracing::debug!(principal = ?tags.principal, tags = ?tags.tags, "Credential accepted");
                ctx.extensions.insert(tags);
                self.inner.call(ctx, inbound, outbound)
            }
            Verdict::Anonymous => {
                if !self.options.anonymous_tags.is_empty() {
                    ctx.extensions.insert(AuthTags {
                        principal: None,
                        tags: self.options.anonymous_tags.clone(),
                    });
                }
                self.inner.call(ctx, inbound, outbound)
            }
            Verdict::Refused => {
                tracing::info!(path = %ctx.path, kind = %ctx.kind, "Credential refused");
                Box::pin(async move {
                    if ctx.kind == ConnectionKind::WebSocket {
                        return WebSocket::new(ctx, inbound, outbound)
                            .reject("invalid credentials")
                            .await;
                    }
                    Response::detail(StatusCode::UNAUTHORIZED, "Invalid credentials", self.challenge())
                        .send(outbound, ctx.is_head())
                        .await
                })
            }
        }
    }
}

pub(crate) fn factory() -> MiddlewareFactory {
    MiddlewareFactory::new(MiddlewareKind::PassThrough, |inner, ctx| {
        Ok(Box::new(AuthMiddleware::new(inner, ctx.options()?)))
    })
}
