// src/core/dispatch/task.rs

//! Executes one inbound query on a pool worker and writes its answer.

use super::TaskParameters;
use super::local::{self, LocalTask, SESSION_PREFIX};
use crate::connection::Session;
use crate::core::auth::{AuthReason, Credential};
use crate::core::methods::{MethodContext, MethodError, Requirement};
use crate::core::protocol::ExecStatus;
use crate::core::state::NodeState;
use crate::core::tasks::pinger::PING_METHOD;
use bytes::Bytes;
use futures::FutureExt;
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// The status and payload of an answer.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub status: ExecStatus,
    pub payload: Value,
}

impl TaskOutcome {
    pub fn success(payload: Value) -> Self {
        Self {
            status: ExecStatus::Success,
            payload,
        }
    }

    pub fn failure(status: ExecStatus, payload: Value) -> Self {
        Self { status, payload }
    }

    pub fn status_only(status: ExecStatus) -> Self {
        Self::failure(status, Value::Null)
    }

    /// A failure whose payload is `{"reason": reason}`.
    pub fn reason(status: ExecStatus, reason: &str) -> Self {
        Self::failure(status, json!({ "reason": reason }))
    }

    /// Encodes the payload for the wire. `null` travels as an empty block.
    pub fn encode_payload(&self) -> Bytes {
        if self.payload.is_null() {
            return Bytes::new();
        }
        match serde_json::to_vec(&self.payload) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                error!("Failed to encode answer payload: {}", e);
                Bytes::new()
            }
        }
    }
}

/// Runs the query described by `params` and sends its answer.
pub async fn run(state: Arc<NodeState>, params: TaskParameters) {
    trace!(
        "Connection {}: running '{}' (request {})",
        params.key(),
        params.method,
        params.request_id
    );
    let outcome = match LocalTask::from_method(&params.method) {
        Some(task) => local::execute(task, &state, &params).await,
        None if params.method.starts_with(SESSION_PREFIX) => {
            TaskOutcome::status_only(ExecStatus::MethodNotFound)
        }
        None => invoke_method(&state, &params).await,
    };

    if let Err(e) = params
        .conn
        .send_answer(params.request_id, outcome.status, outcome.encode_payload())
        .await
    {
        debug!(
            "Connection {}: could not send answer for request {}: {}",
            params.key(),
            params.request_id,
            e
        );
    }
}

/// Hands the query to the methods handler, gated by session state.
async fn invoke_method(state: &NodeState, params: &TaskParameters) -> TaskOutcome {
    let session = match resolve_session(state, params).await {
        Ok(session) => session,
        Err(outcome) => return outcome,
    };
    let methods = &state.methods;
    let method = params.method.as_str();

    if session.is_none() && methods.requires_session(method) {
        return TaskOutcome::status_only(ExecStatus::SessionRequired);
    }
    match methods.validate_requirements(session.as_deref(), method) {
        Requirement::Ok => {}
        Requirement::NotAuthorized => {
            return TaskOutcome::reason(ExecStatus::NotAuthorized, "not_authorized");
        }
        Requirement::NotFound => {
            if method != PING_METHOD {
                state.hooks.on_method_not_found(params.key(), method);
            }
            return TaskOutcome::status_only(ExecStatus::MethodNotFound);
        }
    }

    let payload = match params.decode_payload() {
        Ok(payload) => payload,
        Err(e) => {
            return TaskOutcome::failure(
                ExecStatus::ApplicationError,
                json!({ "reason": "malformed_payload", "detail": e.to_string() }),
            );
        }
    };

    let ctx = MethodContext {
        session: session.clone(),
        peer: params.peer().clone(),
        connection_key: params.key().to_string(),
    };
    match AssertUnwindSafe(methods.invoke(ctx, method, payload))
        .catch_unwind()
        .await
    {
        Ok(Ok(value)) => {
            if let Some(session) = &session {
                session.touch();
            }
            TaskOutcome::success(value)
        }
        Ok(Err(MethodError::Failed(payload))) => {
            TaskOutcome::failure(ExecStatus::ApplicationError, payload)
        }
        Ok(Err(MethodError::Internal(message))) => {
            TaskOutcome::failure(ExecStatus::InternalError, Value::String(message))
        }
        Err(_) => {
            error!(
                "Connection {}: method '{}' panicked",
                params.key(),
                method
            );
            TaskOutcome::failure(
                ExecStatus::InternalError,
                Value::String("method panicked".to_string()),
            )
        }
    }
}

/// Finds the session a call runs under.
///
/// A bound session wins over a per-call token. A revoked session is dropped
/// from the holder and the call refused. Without a bound session, a valid
/// per-call token yields a transient session that is never stored. Tokens
/// naming an impersonator are only honoured by `SESSION.IMPERSONATE`.
async fn resolve_session(
    state: &NodeState,
    params: &TaskParameters,
) -> Result<Option<Arc<Session>>, TaskOutcome> {
    let holder = params.sessions();
    if let Some(session) = holder.get() {
        if session.is_revoked() {
            debug!(
                "Connection {}: dropping revoked session of '{}'",
                params.key(),
                session.user()
            );
            holder.destroy();
            return Err(TaskOutcome::reason(ExecStatus::NotAuthorized, "revoked"));
        }
        return Ok(Some(session));
    }

    let Some(token) = &params.auth_token else {
        return Ok(None);
    };
    let Ok(token) = std::str::from_utf8(token) else {
        return Err(TaskOutcome::reason(
            ExecStatus::NotAuthorized,
            AuthReason::BadCredential.as_str(),
        ));
    };
    let outcome = state
        .authenticator
        .validate(&Credential::Token(token.to_string()))
        .await;
    match (outcome.reason, outcome.identity) {
        (AuthReason::Success, Some(identity)) if identity.impersonator.is_some() => {
            state
                .hooks
                .on_login_failed(params.key(), AuthReason::ImpersonationToken);
            Err(TaskOutcome::reason(
                ExecStatus::NotAuthorized,
                AuthReason::ImpersonationToken.as_str(),
            ))
        }
        (AuthReason::Success, Some(identity)) => {
            Ok(Some(Arc::new(Session::new(identity, outcome.sso))))
        }
        (reason, _) => {
            let reason = if reason == AuthReason::Success {
                AuthReason::InternalError
            } else {
                reason
            };
            state.hooks.on_login_failed(params.key(), reason);
            Err(TaskOutcome::reason(ExecStatus::NotAuthorized, reason.as_str()))
        }
    }
}
