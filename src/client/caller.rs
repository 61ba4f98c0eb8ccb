// src/client/caller.rs

//! Defines `RemoteCaller`, which invokes methods on a peer and waits for the
//! correlated answer.

use crate::config::RpcConfig;
use crate::connection::{ConnectionRegistry, OpenConnection};
use crate::core::auth::Credential;
use crate::core::dispatch::SESSION_PREFIX;
use crate::core::errors::CallError;
use crate::core::metrics;
use crate::core::protocol::ExecStatus;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Per-call switches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Allows calling reserved `SESSION.*` methods.
    pub allow_session_methods: bool,
    /// Waits for a missing connection to appear, with a fixed backoff.
    pub retry_if_disconnected: bool,
    /// Overrides the configured remote execution timeout.
    pub timeout: Option<Duration>,
    /// A token sent with this call only.
    pub auth_token: Option<String>,
}

impl CallOptions {
    pub fn session() -> Self {
        Self {
            allow_session_methods: true,
            ..Self::default()
        }
    }

    pub fn with_retry(mut self) -> Self {
        self.retry_if_disconnected = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Issues calls over the connections of one registry.
#[derive(Debug, Clone)]
pub struct RemoteCaller {
    registry: Arc<ConnectionRegistry>,
    rpc: RpcConfig,
}

impl RemoteCaller {
    pub fn new(registry: Arc<ConnectionRegistry>, rpc: RpcConfig) -> Self {
        Self { registry, rpc }
    }

    /// Invokes `method` on the peer registered under `key`.
    ///
    /// Returns the decoded answer payload on success. Every failure, local or
    /// remote, is reported as exactly one `CallError` variant.
    pub async fn call(
        &self,
        key: &str,
        method: &str,
        payload: &Value,
        options: &CallOptions,
    ) -> Result<Value, CallError> {
        let started = Instant::now();
        let result = self.call_inner(key, method, payload, options).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.label(),
        };
        metrics::CALLS_TOTAL.with_label_values(&[outcome]).inc();
        metrics::CALL_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());
        result
    }

    async fn call_inner(
        &self,
        key: &str,
        method: &str,
        payload: &Value,
        options: &CallOptions,
    ) -> Result<Value, CallError> {
        if method.starts_with(SESSION_PREFIX) && !options.allow_session_methods {
            return Err(CallError::ReservedMethod(method.to_string()));
        }

        let body = if payload.is_null() {
            Bytes::new()
        } else {
            Bytes::from(serde_json::to_vec(payload)?)
        };
        let max = self.rpc.max_message_size;
        if body.len() > max {
            return Err(CallError::PayloadTooLarge {
                size: body.len(),
                max,
            });
        }

        let conn = self.open(key, options.retry_if_disconnected).await?;
        let pending = conn.begin_request();
        trace!(
            "Connection {}: calling '{}' as request {}",
            key,
            method,
            pending.request_id()
        );

        let token = options.auth_token.clone().map(Bytes::from);
        conn.write_frame(pending.query(method, body, token))
            .await
            .map_err(|e| CallError::SendFailed(e.to_string()))?;

        let timeout = options
            .timeout
            .unwrap_or_else(|| self.rpc.remote_exec_timeout());
        let (status, answer) = pending.wait(timeout).await?;
        let answer = decode_answer(&answer);
        match status {
            ExecStatus::Success => answer.map_err(CallError::from),
            status => Err(CallError::from_answer(status, answer.unwrap_or(Value::Null))),
        }
    }

    /// Opens `key`, retrying with a fixed backoff if asked to.
    async fn open(&self, key: &str, retry: bool) -> Result<OpenConnection, CallError> {
        let attempts = if retry {
            self.rpc.remote_exec_retries.saturating_add(1)
        } else {
            1
        };
        for attempt in 1..=attempts {
            if let Some(conn) = self.registry.open(key) {
                if !conn.is_terminated() {
                    return Ok(conn);
                }
                self.registry.release(conn);
            }
            if attempt < attempts {
                debug!(
                    "Peer '{}' not connected (attempt {}/{}), retrying",
                    key, attempt, attempts
                );
                tokio::time::sleep(self.rpc.retry_backoff()).await;
            }
        }
        Err(CallError::NotConnected(key.to_string()))
    }

    /// Calls `method` with a serialisable payload and decodes the answer.
    pub async fn call_json<T, R>(
        &self,
        key: &str,
        method: &str,
        payload: &T,
        options: &CallOptions,
    ) -> Result<R, CallError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload)?;
        let answer = self.call(key, method, &payload, options).await?;
        Ok(serde_json::from_value(answer)?)
    }

    /// Logs in on the peer's side of the connection.
    pub async fn login(&self, key: &str, credential: &Credential) -> Result<Value, CallError> {
        let payload = match credential {
            Credential::Password {
                domain,
                username,
                password,
            } => json!({ "domain": domain, "username": username, "password": password }),
            Credential::Token(token) => json!({ "token": token }),
        };
        self.call(key, "SESSION.LOGIN", &payload, &CallOptions::session())
            .await
    }

    pub async fn logout(&self, key: &str) -> Result<Value, CallError> {
        self.call(key, "SESSION.LOGOUT", &Value::Null, &CallOptions::session())
            .await
    }

    pub async fn session_info(&self, key: &str) -> Result<Value, CallError> {
        self.call(key, "SESSION.INFO", &Value::Null, &CallOptions::session())
            .await
    }

    pub async fn impersonate(&self, key: &str, token: &str) -> Result<Value, CallError> {
        self.call(
            key,
            "SESSION.IMPERSONATE",
            &json!({ "token": token }),
            &CallOptions::session(),
        )
        .await
    }
}

fn decode_answer(payload: &[u8]) -> Result<Value, serde_json::Error> {
    if payload.is_empty() {
        Ok(Value::Null)
    } else {
        serde_json::from_slice(payload)
    }
}
