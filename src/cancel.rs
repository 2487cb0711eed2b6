// Copyright 2020 Joyent, Inc.

//! Server-side record of requests that clients have abandoned.
//!
//! Entries are keyed by connection and request id. Handlers doing chunked
//! or otherwise long-running work poll their [`RequestScope`] between units
//! of work and stop once the caller cancelled or disconnected. A periodic
//! sweep drops entries older than the retention window whether or not any
//! handler ever looked at them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use slog::{debug, o, Logger};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol::RequestId;

/// Identity of one accepted connection, unique for the server's lifetime.
pub type ConnectionId = u64;

/// Default retention window for cancellation entries.
pub const DEFAULT_CANCEL_RETENTION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
pub struct CancellationRegistry {
    entries: Mutex<HashMap<(ConnectionId, RequestId), Instant>>,
    retention: Duration,
}

impl CancellationRegistry {
    pub fn new(retention: Duration) -> CancellationRegistry {
        CancellationRegistry {
            entries: Mutex::new(HashMap::new()),
            retention,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<(ConnectionId, RequestId), Instant>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record that the client abandoned `id`. Marking twice is harmless.
    pub fn mark_cancelled(&self, conn: ConnectionId, id: RequestId) {
        self.entries().entry((conn, id)).or_insert_with(Instant::now);
    }

    pub fn is_cancelled(&self, conn: ConnectionId, id: RequestId) -> bool {
        self.entries().contains_key(&(conn, id))
    }

    /// Remove the entry, reporting whether it was present.
    pub fn consume(&self, conn: ConnectionId, id: RequestId) -> bool {
        self.entries().remove(&(conn, id)).is_some()
    }

    /// Drop every entry belonging to a closed connection.
    pub fn forget_connection(&self, conn: ConnectionId) {
        self.entries().retain(|(c, _), _| *c != conn);
    }

    /// Remove entries recorded before `now - retention`.
    pub fn sweep(&self, now: Instant) -> usize {
        let retention = self.retention;
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, marked| now.saturating_duration_since(*marked) < retention);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Spawn the periodic sweep; it exits when `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
        log: &Logger,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let log = log.new(o!("task" => "cancel-sweeper"));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = registry.sweep(Instant::now());
                        if removed > 0 {
                            debug!(log, "swept cancelled requests"; "removed" => removed);
                        }
                    }
                }
            }
        })
    }
}

impl Default for CancellationRegistry {
    fn default() -> Self {
        CancellationRegistry::new(DEFAULT_CANCEL_RETENTION)
    }
}

/// Stop signal for one in-flight request on the server.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub conn: ConnectionId,
    pub id: RequestId,
    registry: Arc<CancellationRegistry>,
    disconnected: CancellationToken,
}

impl RequestScope {
    pub fn new(
        conn: ConnectionId,
        id: RequestId,
        registry: Arc<CancellationRegistry>,
        disconnected: CancellationToken,
    ) -> RequestScope {
        RequestScope {
            conn,
            id,
            registry,
            disconnected,
        }
    }

    /// True once the caller cancelled this request or its connection closed.
    pub fn should_stop(&self) -> bool {
        self.disconnected.is_cancelled() || self.registry.is_cancelled(self.conn, self.id)
    }

    /// Resolves once the connection closes.
    pub async fn disconnected(&self) {
        self.disconnected.cancelled().await
    }

    /// Clear this request's entry once its handler is done.
    pub fn finish(&self) -> bool {
        self.registry.consume(self.conn, self.id)
    }
}
