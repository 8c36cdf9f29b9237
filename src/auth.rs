//! Authentication seams for server and client.
//!
//! The server validates the first frame's token through an [`AuthProvider`];
//! the client obtains a fresh token for every connection attempt through a
//! [`TokenSource`], which also exposes the session signal that drives
//! connect-on-sign-in and disconnect-on-sign-out.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("no token available: {0}")]
    TokenUnavailable(String),
}

/// Who a validated token belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
}

/// Session signal observed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    SignedOut,
    SignedIn,
}

pub type AuthFuture<T> = Pin<Box<dyn Future<Output = Result<T, AuthError>> + Send>>;

/// Server-side token validation.
pub trait AuthProvider: Send + Sync {
    fn validate(&self, token: &str) -> AuthFuture<Identity>;
}

/// Client-side token supply and session lifecycle.
pub trait TokenSource: Send + Sync {
    /// A fresh token for one connection attempt. Tokens are never cached by
    /// the caller; a token minted before a reconnect may have expired.
    fn fetch_token(&self) -> AuthFuture<String>;

    /// Watch channel carrying the current session state.
    fn session_watch(&self) -> watch::Receiver<SessionState>;
}

/// In-memory token table. Used in tests and single-process deployments;
/// production servers plug in their own [`AuthProvider`].
#[derive(Default)]
pub struct StaticAuth {
    tokens: Mutex<HashMap<String, Identity>>,
}

impl StaticAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, token: impl Into<String>, user_id: impl Into<String>, user_name: impl Into<String>) {
        let identity = Identity {
            user_id: user_id.into(),
            user_name: user_name.into(),
        };
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(token.into(), identity);
        }
    }

    pub fn revoke(&self, token: &str) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(token);
        }
    }
}

impl AuthProvider for StaticAuth {
    fn validate(&self, token: &str) -> AuthFuture<Identity> {
        let found = self
            .tokens
            .lock()
            .ok()
            .and_then(|tokens| tokens.get(token).cloned());
        Box::pin(async move { found.ok_or(AuthError::InvalidToken) })
    }
}

/// Token source holding a single mutable token, with a manually driven
/// session signal.
pub struct StaticTokenSource {
    token: Mutex<Option<String>>,
    session_tx: watch::Sender<SessionState>,
}

impl StaticTokenSource {
    pub fn signed_in(token: impl Into<String>) -> Self {
        let (session_tx, _) = watch::channel(SessionState::SignedIn);
        Self {
            token: Mutex::new(Some(token.into())),
            session_tx,
        }
    }

    pub fn signed_out() -> Self {
        let (session_tx, _) = watch::channel(SessionState::SignedOut);
        Self {
            token: Mutex::new(None),
            session_tx,
        }
    }

    pub fn sign_in(&self, token: impl Into<String>) {
        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(token.into());
        }
        let _ = self.session_tx.send(SessionState::SignedIn);
    }

    pub fn sign_out(&self) {
        if let Ok(mut slot) = self.token.lock() {
            *slot = None;
        }
        let _ = self.session_tx.send(SessionState::SignedOut);
    }
}

impl TokenSource for StaticTokenSource {
    fn fetch_token(&self) -> AuthFuture<String> {
        let token = self.token.lock().ok().and_then(|slot| slot.clone());
        Box::pin(async move {
            token.ok_or_else(|| AuthError::TokenUnavailable("signed out".into()))
        })
    }

    fn session_watch(&self) -> watch::Receiver<SessionState> {
        self.session_tx.subscribe()
    }
}
