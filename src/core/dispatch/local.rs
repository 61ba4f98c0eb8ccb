// src/core/dispatch/local.rs

//! Built-in `SESSION.*` methods, run through the same pool as application
//! methods.

use super::TaskParameters;
use super::task::TaskOutcome;
use crate::connection::{DestroyOutcome, Identity, Session};
use crate::core::auth::{AuthReason, Credential};
use crate::core::protocol::ExecStatus;
use crate::core::state::NodeState;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

/// Method names starting with this prefix are reserved for local tasks.
pub const SESSION_PREFIX: &str = "SESSION.";

/// A built-in session method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalTask {
    Login,
    Logout,
    Info,
    Sso,
    Impersonate,
    SetVar,
    GetVar,
}

const LOCAL_TASKS: &[(&str, LocalTask)] = &[
    ("SESSION.LOGIN", LocalTask::Login),
    ("SESSION.LOGOUT", LocalTask::Logout),
    ("SESSION.INFO", LocalTask::Info),
    ("SESSION.SSO", LocalTask::Sso),
    ("SESSION.IMPERSONATE", LocalTask::Impersonate),
    ("SESSION.SETVAR", LocalTask::SetVar),
    ("SESSION.GETVAR", LocalTask::GetVar),
];

impl LocalTask {
    pub fn from_method(method: &str) -> Option<Self> {
        LOCAL_TASKS
            .iter()
            .find(|(name, _)| *name == method)
            .map(|(_, task)| *task)
    }

    pub fn name(self) -> &'static str {
        LOCAL_TASKS
            .iter()
            .find(|(_, task)| *task == self)
            .map(|(name, _)| *name)
            .unwrap_or("SESSION.UNKNOWN")
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LoginRequest {
    Token {
        token: String,
    },
    Password {
        #[serde(default)]
        domain: Option<String>,
        username: String,
        password: String,
    },
}

impl From<LoginRequest> for Credential {
    fn from(request: LoginRequest) -> Self {
        match request {
            LoginRequest::Token { token } => Credential::Token(token),
            LoginRequest::Password {
                domain,
                username,
                password,
            } => Credential::Password {
                domain,
                username,
                password,
            },
        }
    }
}

#[derive(Deserialize)]
struct TokenRequest {
    token: String,
}

#[derive(Deserialize)]
struct SetVarRequest {
    name: String,
    value: Value,
}

#[derive(Deserialize)]
struct GetVarRequest {
    name: String,
}

/// Whether a bound identity may assume a target identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpersonationCheck {
    Allowed,
    /// The target carries no impersonator claim.
    NoClaim,
    ImpersonatorMismatch,
    CrossDomain,
}

impl ImpersonationCheck {
    pub fn as_str(self) -> &'static str {
        match self {
            ImpersonationCheck::Allowed => "allowed",
            ImpersonationCheck::NoClaim => "no_impersonation_claim",
            ImpersonationCheck::ImpersonatorMismatch => "impersonator_mismatch",
            ImpersonationCheck::CrossDomain => "cross_domain",
        }
    }
}

pub fn check_impersonation(
    current: &Identity,
    target: &Identity,
    allow_cross_domain: bool,
) -> ImpersonationCheck {
    let Some(impersonator) = target.impersonator.as_deref() else {
        return ImpersonationCheck::NoClaim;
    };
    if impersonator != current.user {
        return ImpersonationCheck::ImpersonatorMismatch;
    }
    if !allow_cross_domain && target.domain != current.domain {
        return ImpersonationCheck::CrossDomain;
    }
    ImpersonationCheck::Allowed
}

pub async fn execute(task: LocalTask, state: &NodeState, params: &TaskParameters) -> TaskOutcome {
    debug!("Connection {}: local task {}", params.key(), task.name());
    match task {
        LocalTask::Login => login(state, params).await,
        LocalTask::Logout => logout(params),
        LocalTask::Info => session_info(params),
        LocalTask::Sso => sso_info(params),
        LocalTask::Impersonate => impersonate(state, params).await,
        LocalTask::SetVar => set_var(params),
        LocalTask::GetVar => get_var(params),
    }
}

fn decode_request<T: DeserializeOwned>(params: &TaskParameters) -> Result<T, TaskOutcome> {
    params
        .decode_payload()
        .and_then(serde_json::from_value)
        .map_err(|_| TaskOutcome::reason(ExecStatus::ApplicationError, "malformed_request"))
}

/// The bound, non-revoked session.
fn bound_session(params: &TaskParameters) -> Result<Arc<Session>, TaskOutcome> {
    let holder = params.sessions();
    let Some(session) = holder.get() else {
        return Err(TaskOutcome::status_only(ExecStatus::SessionRequired));
    };
    if session.is_revoked() {
        holder.destroy();
        return Err(TaskOutcome::reason(ExecStatus::NotAuthorized, "revoked"));
    }
    Ok(session)
}

async fn login(state: &NodeState, params: &TaskParameters) -> TaskOutcome {
    if params.sessions().get().is_some() {
        return TaskOutcome::reason(ExecStatus::ApplicationError, "already_logged_in");
    }
    let request: LoginRequest = match decode_request(params) {
        Ok(request) => request,
        Err(outcome) => return outcome,
    };

    let outcome = state.authenticator.validate(&request.into()).await;
    let identity = match (outcome.reason, outcome.identity) {
        (AuthReason::Success, Some(identity)) if identity.impersonator.is_some() => {
            state
                .hooks
                .on_login_failed(params.key(), AuthReason::ImpersonationToken);
            return TaskOutcome::reason(
                ExecStatus::ApplicationError,
                AuthReason::ImpersonationToken.as_str(),
            );
        }
        (AuthReason::Success, Some(identity)) => identity,
        (reason, _) => {
            let reason = if reason == AuthReason::Success {
                AuthReason::InternalError
            } else {
                reason
            };
            state.hooks.on_login_failed(params.key(), reason);
            return TaskOutcome::reason(ExecStatus::ApplicationError, reason.as_str());
        }
    };

    match params.sessions().create(identity, outcome.sso) {
        Some(session) => {
            info!(
                "Connection {}: '{}' logged in",
                params.key(),
                session.user()
            );
            TaskOutcome::success(json!({ "session": session.metadata() }))
        }
        None => TaskOutcome::reason(ExecStatus::InternalError, "session_conflict"),
    }
}

fn logout(params: &TaskParameters) -> TaskOutcome {
    match params.sessions().destroy() {
        DestroyOutcome::Destroyed(session) => {
            info!(
                "Connection {}: '{}' logged out",
                params.key(),
                session.user()
            );
            TaskOutcome::success(json!({ "destroyed": true }))
        }
        DestroyOutcome::NothingToDestroy => {
            TaskOutcome::success(json!({ "destroyed": false, "reason": "nothing_to_destroy" }))
        }
    }
}

/// Reports `last_activity` as it stood before this query.
fn session_info(params: &TaskParameters) -> TaskOutcome {
    match bound_session(params) {
        Ok(session) => {
            let metadata = session.metadata();
            session.touch();
            TaskOutcome::success(metadata)
        }
        Err(outcome) => outcome,
    }
}

fn sso_info(params: &TaskParameters) -> TaskOutcome {
    match bound_session(params) {
        Ok(session) => {
            session.touch();
            TaskOutcome::success(json!({
                "user": session.user(),
                "domain": session.identity().domain,
                "sso": session.sso(),
            }))
        }
        Err(outcome) => outcome,
    }
}

async fn impersonate(state: &NodeState, params: &TaskParameters) -> TaskOutcome {
    let current = match bound_session(params) {
        Ok(session) => session,
        Err(outcome) => return outcome,
    };
    let request: TokenRequest = match decode_request(params) {
        Ok(request) => request,
        Err(outcome) => return outcome,
    };

    let outcome = state
        .authenticator
        .validate(&Credential::Token(request.token))
        .await;
    let target = match (outcome.reason, outcome.identity) {
        (AuthReason::Success, Some(identity)) => identity,
        (AuthReason::Success, None) => {
            return TaskOutcome::reason(
                ExecStatus::NotAuthorized,
                AuthReason::InternalError.as_str(),
            );
        }
        (reason, _) => return TaskOutcome::reason(ExecStatus::NotAuthorized, reason.as_str()),
    };

    let allow_cross_domain = state.config.auth.allow_cross_domain_impersonation;
    match check_impersonation(current.identity(), &target, allow_cross_domain) {
        ImpersonationCheck::Allowed => {}
        refused => return TaskOutcome::reason(ExecStatus::NotAuthorized, refused.as_str()),
    }

    let user = target.user.clone();
    match params
        .sessions()
        .replace(&current, Session::new(target, outcome.sso))
    {
        Some(session) => {
            info!(
                "Connection {}: '{}' now impersonating '{}'",
                params.key(),
                current.user(),
                user
            );
            TaskOutcome::success(json!({ "session": session.metadata() }))
        }
        None => TaskOutcome::reason(ExecStatus::InternalError, "session_conflict"),
    }
}

fn set_var(params: &TaskParameters) -> TaskOutcome {
    let session = match bound_session(params) {
        Ok(session) => session,
        Err(outcome) => return outcome,
    };
    let request: SetVarRequest = match decode_request(params) {
        Ok(request) => request,
        Err(outcome) => return outcome,
    };
    let previous = session.set_var(request.name, request.value);
    session.touch();
    TaskOutcome::success(json!({ "previous": previous }))
}

fn get_var(params: &TaskParameters) -> TaskOutcome {
    let session = match bound_session(params) {
        Ok(session) => session,
        Err(outcome) => return outcome,
    };
    let request: GetVarRequest = match decode_request(params) {
        Ok(request) => request,
        Err(outcome) => return outcome,
    };
    session.touch();
    TaskOutcome::success(json!({ "value": session.get_var(&request.name) }))
}
