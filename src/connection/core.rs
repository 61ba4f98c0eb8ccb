// src/connection/core.rs

//! Defines `Connection`, the per-stream state shared by the protocol dispatcher,
//! the remote-call facade and the pinger.

use super::session::SessionHolder;
use crate::core::errors::{CallError, PeerLinkError};
use crate::core::protocol::{Answer, ExecStatus, Frame, FrameCodec, Query};
use bytes::Bytes;
use futures::SinkExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio_util::codec::FramedWrite;
use tracing::{debug, trace};

/// The write half of a connection's stream, boxed so TCP, TLS and in-memory
/// transports share one `Connection` type.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// What is known about the remote end of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: Option<SocketAddr>,
    /// The TLS identity of the peer: the server name we dialled, or the
    /// fingerprint of the certificate a client presented.
    pub tls_identity: Option<String>,
}

impl PeerInfo {
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            addr: Some(addr),
            tls_identity: None,
        }
    }
}

/// Request correlation state. A request id is either pending (awaiting its
/// answer) or answered (payload and status stored, awaiting collection).
#[derive(Debug, Default)]
struct Correlation {
    pending: HashSet<u64>,
    answers: HashMap<u64, Bytes>,
    statuses: HashMap<u64, ExecStatus>,
}

/// Sizes of the correlation maps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationStats {
    pub pending: usize,
    pub answers: usize,
    pub statuses: usize,
}

impl CorrelationStats {
    pub fn is_empty(&self) -> bool {
        self.pending == 0 && self.answers == 0 && self.statuses == 0
    }
}

/// A live, registered link to one peer.
pub struct Connection {
    key: String,
    peer: PeerInfo,
    /// Serialises every frame write on the stream.
    writer: tokio::sync::Mutex<FramedWrite<BoxedWriter, FrameCodec>>,
    write_timeout: Option<Duration>,
    next_request_id: Mutex<u64>,
    /// Only mutated while this lock is held; waiters are woken through `answered`.
    correlation: Mutex<Correlation>,
    answered: Notify,
    terminated: AtomicBool,
    sessions: SessionHolder,
    /// Shared by every in-flight task, taken exclusively by teardown.
    in_flight: Arc<RwLock<()>>,
    last_received: Mutex<Instant>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("peer", &self.peer)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl Connection {
    pub fn new(
        key: impl Into<String>,
        peer: PeerInfo,
        writer: BoxedWriter,
        codec: FrameCodec,
        write_timeout: Option<Duration>,
    ) -> Self {
        Self {
            key: key.into(),
            peer,
            writer: tokio::sync::Mutex::new(FramedWrite::new(writer, codec)),
            write_timeout,
            next_request_id: Mutex::new(0),
            correlation: Mutex::new(Correlation::default()),
            answered: Notify::new(),
            terminated: AtomicBool::new(false),
            sessions: SessionHolder::new(),
            in_flight: Arc::new(RwLock::new(())),
            last_received: Mutex::new(Instant::now()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn sessions(&self) -> &SessionHolder {
        &self.sessions
    }

    /// Allocates the next request id. Ids are never zero and never reused
    /// during the connection's lifetime.
    fn allocate_request_id(&self) -> u64 {
        let mut next = self.next_request_id.lock();
        *next = next.wrapping_add(1).max(1);
        *next
    }

    /// Allocates a request id and records it as pending.
    ///
    /// The returned guard removes every trace of the id when dropped, whether
    /// the call was answered, timed out or was cancelled.
    pub fn begin_request(&self) -> PendingRequest<'_> {
        let request_id = self.allocate_request_id();
        self.correlation.lock().pending.insert(request_id);
        PendingRequest {
            conn: self,
            request_id,
        }
    }

    /// Stores an answer for a pending request and wakes every waiter.
    ///
    /// Returns `false`, leaving all maps untouched, if the id is not pending.
    pub fn deliver_answer(&self, answer: Answer) -> bool {
        {
            let mut correlation = self.correlation.lock();
            if !correlation.pending.remove(&answer.request_id) {
                return false;
            }
            correlation
                .answers
                .insert(answer.request_id, answer.payload);
            correlation
                .statuses
                .insert(answer.request_id, answer.status);
        }
        self.answered.notify_waiters();
        true
    }

    fn take_answer(&self, request_id: u64) -> Option<(ExecStatus, Bytes)> {
        let mut correlation = self.correlation.lock();
        let status = correlation.statuses.remove(&request_id)?;
        let payload = correlation.answers.remove(&request_id).unwrap_or_default();
        Some((status, payload))
    }

    fn forget(&self, request_id: u64) {
        let mut correlation = self.correlation.lock();
        correlation.pending.remove(&request_id);
        correlation.answers.remove(&request_id);
        correlation.statuses.remove(&request_id);
    }

    pub fn correlation_stats(&self) -> CorrelationStats {
        let correlation = self.correlation.lock();
        CorrelationStats {
            pending: correlation.pending.len(),
            answers: correlation.answers.len(),
            statuses: correlation.statuses.len(),
        }
    }

    /// Waits until `request_id` is answered, the connection terminates or
    /// `timeout` elapses. When several hold at once the answer wins, then
    /// termination.
    async fn wait_for_answer(
        &self,
        request_id: u64,
        timeout: Duration,
    ) -> Result<(ExecStatus, Bytes), CallError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking the predicate so a wakeup
            // between the check and the await is not lost.
            let notified = self.answered.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(answer) = self.take_answer(request_id) {
                return Ok(answer);
            }
            if self.is_terminated() {
                return Err(CallError::ConnectionLost);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CallError::Timeout(timeout));
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Marks the connection terminated and wakes every waiting caller.
    pub fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.answered.notify_waiters();
    }

    /// Writes one frame as a single critical section under the write mutex.
    pub async fn write_frame(&self, frame: Frame) -> Result<(), PeerLinkError> {
        trace!("Connection {}: writing {} frame", self.key, frame.kind());
        let mut writer = self.writer.lock().await;
        match self.write_timeout {
            Some(limit) => tokio::time::timeout(limit, writer.send(frame))
                .await
                .map_err(|_| PeerLinkError::WriteTimeout)?,
            None => writer.send(frame).await,
        }
    }

    pub async fn send_answer(
        &self,
        request_id: u64,
        status: ExecStatus,
        payload: Bytes,
    ) -> Result<(), PeerLinkError> {
        self.write_frame(Frame::Answer(Answer {
            request_id,
            status,
            payload,
        }))
        .await
    }

    /// Shuts down the write half of the stream. Errors are only logged; the
    /// peer may already be gone.
    pub async fn close_stream(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.get_mut().shutdown().await {
            debug!("Connection {}: error closing stream: {}", self.key, e);
        }
    }

    /// A shared hold on the connection, kept by a task until its answer is sent.
    pub async fn hold_in_flight(&self) -> OwnedRwLockReadGuard<()> {
        Arc::clone(&self.in_flight).read_owned().await
    }

    /// Resolves once every in-flight task has released its hold.
    pub async fn drain_in_flight(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.in_flight).write_owned().await
    }

    pub fn touch_received(&self) {
        *self.last_received.lock() = Instant::now();
    }

    /// Time since the last frame was received from the peer.
    pub fn idle_for(&self) -> Duration {
        self.last_received.lock().elapsed()
    }
}

/// A request id awaiting its answer on a `Connection`.
#[derive(Debug)]
pub struct PendingRequest<'a> {
    conn: &'a Connection,
    request_id: u64,
}

impl PendingRequest<'_> {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Builds the query frame carrying this request id.
    pub fn query(&self, method: &str, payload: Bytes, auth_token: Option<Bytes>) -> Frame {
        Frame::Query(Query {
            request_id: self.request_id,
            method: method.to_string(),
            payload,
            auth_token,
        })
    }

    pub async fn wait(&self, timeout: Duration) -> Result<(ExecStatus, Bytes), CallError> {
        self.conn.wait_for_answer(self.request_id, timeout).await
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.conn.forget(self.request_id);
    }
}
