// src/connection/session.rs

//! Defines the authenticated `Session` and the per-connection `SessionHolder`.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Who a session acts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Set when this identity was obtained by impersonation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonator: Option<String>,
}

impl Identity {
    pub fn new(user: impl Into<String>, domain: Option<String>) -> Self {
        Self {
            user: user.into(),
            domain,
            impersonator: None,
        }
    }
}

/// One authenticated identity bound to a connection.
///
/// Shared by reference count between the `SessionHolder` and any in-flight task
/// that captured it at dispatch time.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    identity: Identity,
    /// Claims carried by the token that created the session, if any.
    sso: Option<Value>,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    revoked: AtomicBool,
    variables: RwLock<HashMap<String, Value>>,
}

impl Session {
    pub fn new(identity: Identity, sso: Option<Value>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            identity,
            sso,
            created_at: now,
            last_activity: Mutex::new(now),
            revoked: AtomicBool::new(false),
            variables: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user(&self) -> &str {
        &self.identity.user
    }

    pub fn sso(&self) -> Option<&Value> {
        self.sso.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// Records activity on the session.
    pub fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    /// Marks the session as revoked. The holder drops it on the next call.
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    pub fn set_var(&self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.variables.write().insert(name.into(), value)
    }

    pub fn get_var(&self, name: &str) -> Option<Value> {
        self.variables.read().get(name).cloned()
    }

    /// The session metadata returned by `SESSION.INFO` and `SESSION.LOGIN`.
    pub fn metadata(&self) -> Value {
        json!({
            "id": self.id.to_string(),
            "user": self.identity.user,
            "domain": self.identity.domain,
            "impersonator": self.identity.impersonator,
            "created_at": self.created_at.to_rfc3339(),
            "last_activity": self.last_activity().to_rfc3339(),
            "variables": *self.variables.read(),
        })
    }
}

/// Result of `SessionHolder::destroy`.
#[derive(Debug)]
pub enum DestroyOutcome {
    Destroyed(Arc<Session>),
    NothingToDestroy,
}

impl DestroyOutcome {
    pub fn is_destroyed(&self) -> bool {
        matches!(self, DestroyOutcome::Destroyed(_))
    }
}

/// The single session slot of a connection.
///
/// Guarded by its own mutex, independent of the connection's I/O locks.
#[derive(Debug, Default)]
pub struct SessionHolder {
    slot: Mutex<Option<Arc<Session>>>,
}

impl SessionHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session in the empty slot.
    ///
    /// Returns `None` if a session already exists; this is the only place that
    /// enforces "at most one session per connection".
    pub fn create(&self, identity: Identity, sso: Option<Value>) -> Option<Arc<Session>> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return None;
        }
        let session = Arc::new(Session::new(identity, sso));
        *slot = Some(Arc::clone(&session));
        Some(session)
    }

    /// Clears the slot. Destroying an empty slot is not an error.
    pub fn destroy(&self) -> DestroyOutcome {
        match self.slot.lock().take() {
            Some(session) => DestroyOutcome::Destroyed(session),
            None => DestroyOutcome::NothingToDestroy,
        }
    }

    /// Returns the current session without removing it.
    pub fn get(&self) -> Option<Arc<Session>> {
        self.slot.lock().clone()
    }

    /// Substitutes `replacement` for the bound session, but only if the slot
    /// still holds `expected`.
    pub fn replace(&self, expected: &Arc<Session>, replacement: Session) -> Option<Arc<Session>> {
        let mut slot = self.slot.lock();
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, expected) => {
                let session = Arc::new(replacement);
                *slot = Some(Arc::clone(&session));
                Some(session)
            }
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}
