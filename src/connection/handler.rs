// src/connection/handler.rs

//! Defines the `ConnectionHandler`, the per-connection read loop that routes
//! inbound frames and tears the connection down when the loop ends.

use super::core::Connection;
use super::session::DestroyOutcome;
use crate::core::dispatch::{self, TaskParameters};
use crate::core::errors::PeerLinkError;
use crate::core::hooks::CloseReason;
use crate::core::metrics;
use crate::core::protocol::{Answer, Frame, FrameCodec, Query};
use crate::core::state::NodeState;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::broadcast;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, trace, warn};

/// The read half of a connection's stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Drives one connection from registration to teardown.
pub struct ConnectionHandler {
    reader: FramedRead<BoxedReader, FrameCodec>,
    conn: Arc<Connection>,
    state: Arc<NodeState>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ConnectionHandler {
    pub fn new(
        reader: BoxedReader,
        conn: Arc<Connection>,
        state: Arc<NodeState>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let codec = state.codec();
        Self {
            reader: FramedRead::new(reader, codec),
            conn,
            state,
            shutdown_rx,
        }
    }

    /// Runs the read loop until it ends, then tears the connection down.
    pub async fn run(mut self) -> CloseReason {
        let reason = self.read_loop().await;
        self.teardown(&reason).await;
        reason
    }

    async fn read_loop(&mut self) -> CloseReason {
        let read_timeout = self.state.config.rpc.read_timeout();
        loop {
            let next = tokio::select! {
                // Prioritize shutdown signals over other events.
                biased;
                _ = self.shutdown_rx.recv() => {
                    info!("Connection {}: node shutting down, notifying peer.", self.conn.key());
                    if let Err(e) = self.conn.write_frame(Frame::Shutdown).await {
                        debug!("Connection {}: could not send shutdown frame: {}", self.conn.key(), e);
                    }
                    return CloseReason::LocalShutdown;
                }
                next = read_frame(&mut self.reader, read_timeout) => next,
            };

            match next {
                Ok(Some(frame)) => {
                    trace!("Connection {}: received {} frame", self.conn.key(), frame.kind());
                    self.conn.touch_received();
                    match frame {
                        Frame::Answer(answer) => self.process_answer(answer),
                        Frame::Query(query) => self.process_query(query).await,
                        Frame::Shutdown => {
                            info!("Connection {}: peer requested shutdown.", self.conn.key());
                            return CloseReason::PeerShutdown;
                        }
                    }
                }
                Ok(None) => {
                    debug!("Connection {} closed by peer.", self.conn.key());
                    return CloseReason::PeerClosed;
                }
                Err(PeerLinkError::ReadTimeout) => {
                    warn!("Connection {}: read timed out.", self.conn.key());
                    return CloseReason::ReadTimeout;
                }
                Err(e) => {
                    warn!("Connection {}: framing error: {}", self.conn.key(), e);
                    return CloseReason::InvalidProtocol(e.to_string());
                }
            }
        }
    }

    fn process_answer(&self, answer: Answer) {
        let request_id = answer.request_id;
        let status = answer.status;
        if !self.conn.deliver_answer(answer) {
            metrics::UNEXPECTED_ANSWERS_TOTAL.inc();
            debug!(
                "Connection {}: discarding answer for unknown request {}",
                self.conn.key(),
                request_id
            );
            self.state
                .hooks
                .on_unexpected_answer(self.conn.key(), request_id, status);
        }
    }

    async fn process_query(&mut self, query: Query) {
        metrics::QUERIES_RECEIVED_TOTAL.inc();
        let in_flight = self.conn.hold_in_flight().await;
        let params = TaskParameters::new(Arc::clone(&self.conn), query, in_flight);
        dispatch::submit(&self.state, params).await;
    }

    /// Drains in-flight tasks, wakes waiting callers, drops the session and
    /// finally removes the connection from the registry.
    async fn teardown(&mut self, reason: &CloseReason) {
        let key = self.conn.key();
        let drained = self.conn.drain_in_flight().await;
        self.conn.mark_terminated();
        if let DestroyOutcome::Destroyed(session) = self.conn.sessions().destroy() {
            debug!("Connection {}: session of '{}' destroyed.", key, session.user());
        }
        drop(drained);

        self.state.registry.destroy(key).await;
        self.state.hooks.on_connection_closed(key, reason);
        if reason.is_clean() {
            info!("Connection {} closed ({:?}).", key, reason);
        } else {
            warn!("Connection {} terminated ({:?}).", key, reason);
        }
    }
}

/// Reads the next frame, failing with `ReadTimeout` if none arrives in time.
async fn read_frame(
    reader: &mut FramedRead<BoxedReader, FrameCodec>,
    read_timeout: Option<Duration>,
) -> Result<Option<Frame>, PeerLinkError> {
    let next = match read_timeout {
        Some(limit) => tokio::time::timeout(limit, reader.next())
            .await
            .map_err(|_| PeerLinkError::ReadTimeout)?,
        None => reader.next().await,
    };
    next.transpose()
}
