//! Capability handlers and per-kind sessions.
//!
//! A handler serves one kind prefix (e.g. `browser.`) and declares the
//! payload keys it consumes. The dispatcher extracts only those keys
//! from the envelope before invoking the handler, so producers can add
//! fields without breaking older workers.
//!
//! Handlers that need expensive state (a browser context, a protocol
//! connection) get a [`Session`] that the worker creates lazily on
//! first use, reuses across jobs of the same kind, and tears down on
//! shutdown, after `max_tasks_per_child` jobs, or when a handler
//! failure is marked session-fatal.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

/// Failure signalled by a handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Recoverable failure; the delivery stays pending and is retried.
    #[error("transient handler failure: {message}")]
    Transient {
        message: String,
        /// When set, the session is torn down before the retry (the
        /// failure poisoned the session, e.g. a dead browser).
        session_fatal: bool,
    },

    /// Unrecoverable failure; the job is acknowledged and a failure
    /// result published.
    #[error("permanent handler failure: {message}")]
    Permanent { message: String },
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            session_fatal: false,
        }
    }

    pub fn transient_session_fatal(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            session_fatal: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            HandlerError::Transient {
                session_fatal: true,
                ..
            }
        )
    }
}

/// Per-kind resource bag entry (a browser context, a model handle, a
/// protocol connection).
#[async_trait]
pub trait Session: Send + Sync {
    /// Releases the session's resources. Must be safe to call once.
    async fn teardown(&mut self);
}

/// A capability serving one kind prefix.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Kind prefix served, including the dot: `"browser."`.
    fn prefix(&self) -> &str;

    /// Payload keys this handler consumes. The dispatcher passes only
    /// these to [`Handler::handle`]; everything else in the payload is
    /// dropped.
    fn arg_keys(&self) -> &[&str];

    /// Creates the session used by jobs of this kind.
    async fn create_session(&self) -> Result<Box<dyn Session>, HandlerError>;

    /// Handles one operation. `op` is the kind with the prefix
    /// stripped (`browser.navigate` -> `navigate`).
    async fn handle(
        &self,
        op: &str,
        args: Map<String, Value>,
        session: &mut dyn Session,
    ) -> Result<Value, HandlerError>;
}

/// Extracts only the declared keys from a payload.
pub fn extract_args(payload: &Map<String, Value>, keys: &[&str]) -> Map<String, Value> {
    keys.iter()
        .filter_map(|k| payload.get(*k).map(|v| (k.to_string(), v.clone())))
        .collect()
}

/// Static registry mapping kind prefixes to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        info!(prefix = %handler.prefix(), "handler registered");
        self.handlers.push(handler);
    }

    /// Finds the handler whose prefix matches the kind. Unknown kinds
    /// are permanent failures for the dispatcher.
    pub fn find(&self, kind: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.iter().find(|h| kind.starts_with(h.prefix()))
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Sessions held by one worker, keyed by handler prefix.
///
/// Owned by the worker and bounded by its lifetime; nothing outside the
/// worker can reach into the bag.
#[derive(Default)]
pub struct SessionBag {
    sessions: HashMap<String, Box<dyn Session>>,
}

impl SessionBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session for the handler, creating it on first use.
    pub async fn get_or_create(
        &mut self,
        handler: &Arc<dyn Handler>,
    ) -> Result<&mut Box<dyn Session>, HandlerError> {
        let prefix = handler.prefix();
        if !self.sessions.contains_key(prefix) {
            info!(prefix = %prefix, "creating session");
            let session = handler.create_session().await?;
            self.sessions.insert(prefix.to_string(), session);
        }
        match self.sessions.get_mut(prefix) {
            Some(session) => Ok(session),
            None => Err(HandlerError::permanent("session disappeared from bag")),
        }
    }

    /// Tears down and removes the session for one prefix.
    pub async fn teardown(&mut self, prefix: &str) {
        if let Some(mut session) = self.sessions.remove(prefix) {
            warn!(prefix = %prefix, "tearing down session");
            session.teardown().await;
        }
    }

    /// Tears down every session. Called on shutdown and when the
    /// `max_tasks_per_child` recycle threshold is reached.
    pub async fn teardown_all(&mut self) {
        for (prefix, mut session) in self.sessions.drain() {
            info!(prefix = %prefix, "tearing down session");
            session.teardown().await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
