use {
    secrecy::{ExposeSecret, Secret},
    subtle::ConstantTimeEq,
};

use {tradeclaw_config::schema::GatewayConfig, tradeclaw_protocol::error_codes};

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ResolvedToken {
    secret: Secret<String>,
    label: Option<String>,
    expires_at_ms: Option<u64>,
}

/// Resolved gateway auth configuration. With no tokens configured every
/// connection is accepted.
#[derive(Debug, Clone, Default)]
pub struct ResolvedAuth {
    tokens: Vec<ResolvedToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    Missing,
    Mismatch,
    Expired,
}

impl AuthFailure {
    pub fn code(self) -> &'static str {
        match self {
            Self::Missing | Self::Mismatch => error_codes::AUTH_INVALID,
            Self::Expired => error_codes::AUTH_EXPIRED,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Missing => "token_missing",
            Self::Mismatch => "token_mismatch",
            Self::Expired => "token_expired",
        }
    }
}

/// Result of an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// No token configured.
    Open,
    /// Matched a configured token, by label when it has one.
    Token { label: Option<String> },
    Denied(AuthFailure),
}

impl AuthResult {
    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Denied(_))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn safe_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// ── Auth logic ───────────────────────────────────────────────────────────────

/// Resolve auth from config plus an optional token from the environment.
pub fn resolve_auth(config: &GatewayConfig, env_token: Option<String>) -> ResolvedAuth {
    let shared = config
        .token
        .clone()
        .into_iter()
        .chain(env_token)
        .filter(|t| !t.is_empty())
        .map(|token| ResolvedToken {
            secret: Secret::new(token),
            label: None,
            expires_at_ms: None,
        });
    let named = config
        .tokens
        .iter()
        .filter(|t| !t.token.is_empty())
        .map(|t| ResolvedToken {
            secret: Secret::new(t.token.clone()),
            label: t.label.clone(),
            expires_at_ms: t.expires_at_ms,
        });
    ResolvedAuth {
        tokens: shared.chain(named).collect(),
    }
}

impl ResolvedAuth {
    pub fn is_open(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Authenticate a `connect` request at `now_ms`.
    pub fn authorize_connect(&self, provided: Option<&str>, now_ms: u64) -> AuthResult {
        if self.is_open() {
            return AuthResult::Open;
        }
        let Some(given) = provided.filter(|t| !t.is_empty()) else {
            return AuthResult::Denied(AuthFailure::Missing);
        };
        let Some(matched) = self
            .tokens
            .iter()
            .find(|t| safe_equal(given, t.secret.expose_secret()))
        else {
            return AuthResult::Denied(AuthFailure::Mismatch);
        };
        if matched.expires_at_ms.is_some_and(|at| now_ms >= at) {
            return AuthResult::Denied(AuthFailure::Expired);
        }
        AuthResult::Token {
            label: matched.label.clone(),
        }
    }
}
