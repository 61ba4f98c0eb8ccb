// src/core/methods.rs

//! Application methods: the `MethodsHandler` seam and the `MethodRegistry`
//! table-based implementation.

use crate::connection::{PeerInfo, Session};
use crate::core::dispatch::local::SESSION_PREFIX;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// The context an application method runs in.
#[derive(Debug, Clone)]
pub struct MethodContext {
    pub session: Option<Arc<Session>>,
    pub peer: PeerInfo,
    pub connection_key: String,
}

/// A failure reported by an application method.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MethodError {
    /// Answered with the application-error status and this payload.
    #[error("method failed: {0}")]
    Failed(Value),
    /// Answered with the internal-error status.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result of checking whether a caller may invoke a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Ok,
    NotAuthorized,
    NotFound,
}

#[async_trait]
pub trait MethodsHandler: Send + Sync {
    /// Whether `method` may only be invoked with a bound session.
    fn requires_session(&self, method: &str) -> bool;

    fn validate_requirements(&self, session: Option<&Session>, method: &str) -> Requirement;

    async fn invoke(
        &self,
        ctx: MethodContext,
        method: &str,
        payload: Value,
    ) -> Result<Value, MethodError>;
}

type MethodFn = Arc<dyn Fn(MethodContext, Value) -> BoxFuture<'static, Result<Value, MethodError>> + Send + Sync>;

struct MethodEntry {
    handler: MethodFn,
    requires_session: bool,
    /// When set, only sessions of this domain may call the method.
    domain: Option<String>,
}

/// Maps method names to async handlers.
#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<String, MethodEntry>,
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("MethodRegistry").field("methods", &names).finish()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a method callable without a session.
    pub fn register<F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(MethodContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, MethodError>> + Send + 'static,
    {
        self.insert(name, handler, false, None)
    }

    /// Registers a method that needs an authenticated session.
    pub fn register_with_session<F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(MethodContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, MethodError>> + Send + 'static,
    {
        self.insert(name, handler, true, None)
    }

    /// Registers a method restricted to sessions of `domain`.
    pub fn register_for_domain<F, Fut>(&mut self, name: &str, domain: &str, handler: F) -> &mut Self
    where
        F: Fn(MethodContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, MethodError>> + Send + 'static,
    {
        self.insert(name, handler, true, Some(domain.to_string()))
    }

    fn insert<F, Fut>(
        &mut self,
        name: &str,
        handler: F,
        requires_session: bool,
        domain: Option<String>,
    ) -> &mut Self
    where
        F: Fn(MethodContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, MethodError>> + Send + 'static,
    {
        if name.is_empty() || name.starts_with(SESSION_PREFIX) {
            warn!("Refusing to register method '{}': reserved or empty name", name);
            return self;
        }
        let handler: MethodFn = Arc::new(move |ctx, payload| Box::pin(handler(ctx, payload)));
        self.methods.insert(
            name.to_string(),
            MethodEntry {
                handler,
                requires_session,
                domain,
            },
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[async_trait]
impl MethodsHandler for MethodRegistry {
    fn requires_session(&self, method: &str) -> bool {
        self.methods
            .get(method)
            .is_some_and(|entry| entry.requires_session)
    }

    fn validate_requirements(&self, session: Option<&Session>, method: &str) -> Requirement {
        let Some(entry) = self.methods.get(method) else {
            return Requirement::NotFound;
        };
        if entry.requires_session && session.is_none() {
            return Requirement::NotAuthorized;
        }
        if let Some(domain) = &entry.domain {
            let session_domain = session.and_then(|s| s.identity().domain.as_deref());
            if session_domain != Some(domain.as_str()) {
                return Requirement::NotAuthorized;
            }
        }
        Requirement::Ok
    }

    async fn invoke(
        &self,
        ctx: MethodContext,
        method: &str,
        payload: Value,
    ) -> Result<Value, MethodError> {
        let Some(entry) = self.methods.get(method) else {
            return Err(MethodError::Internal(format!("method '{method}' vanished")));
        };
        let handler = Arc::clone(&entry.handler);
        handler(ctx, payload).await
    }
}
