//! Session hub
//!
//! Registry of live sessions keyed by user and connection id. Enforces the
//! per-user connection limit, evicts idle sessions, and closes everything on
//! shutdown.

use super::connection::SessionConnection;
use crate::error::HubError;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type UserSessions = HashMap<String, Arc<SessionConnection>>;

/// Hub counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub total_users: usize,
    pub total_connections: usize,
    pub max_conn_per_user: usize,
}

pub struct SessionHub {
    sessions: RwLock<HashMap<String, UserSessions>>,
    max_conn_per_user: usize,
    shut_down: AtomicBool,
}

impl SessionHub {
    pub fn new(max_conn_per_user: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_conn_per_user,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn max_conn_per_user(&self) -> usize {
        self.max_conn_per_user
    }

    /// Admit `conn` if its user is below the connection limit.
    ///
    /// On error the caller must not run the connection.
    pub fn register(&self, conn: Arc<SessionConnection>) -> Result<(), HubError> {
        let mut sessions = self.sessions.write();
        if self.shut_down.load(Ordering::Acquire) {
            return Err(HubError::ShuttingDown);
        }

        let user = sessions.entry(conn.user_id().to_string()).or_default();
        if user.len() >= self.max_conn_per_user {
            let err = HubError::TooManyConnections {
                user_id: conn.user_id().to_string(),
                max: self.max_conn_per_user,
            };
            if user.is_empty() {
                sessions.remove(conn.user_id());
            }
            warn!(
                user_id = %conn.user_id(),
                max = self.max_conn_per_user,
                "Session rejected, connection limit reached"
            );
            return Err(err);
        }

        user.insert(conn.id().to_string(), conn.clone());
        info!(
            connection_id = %conn.id(),
            user_id = %conn.user_id(),
            device_id = %conn.device_id(),
            user_connections = user.len(),
            "Session registered"
        );
        Ok(())
    }

    /// Remove `conn`. Drops the user entry once it is empty.
    pub fn unregister(&self, conn: &SessionConnection) {
        let mut sessions = self.sessions.write();
        let Some(user) = sessions.get_mut(conn.user_id()) else {
            return;
        };
        if user.remove(conn.id()).is_some() {
            debug!(connection_id = %conn.id(), user_id = %conn.user_id(), "Session unregistered");
        }
        if user.is_empty() {
            sessions.remove(conn.user_id());
        }
    }

    pub fn get_connection(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Option<Arc<SessionConnection>> {
        self.sessions
            .read()
            .get(user_id)
            .and_then(|user| user.get(connection_id).cloned())
    }

    pub fn user_connections(&self, user_id: &str) -> Vec<Arc<SessionConnection>> {
        self.sessions
            .read()
            .get(user_id)
            .map(|user| user.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.sessions.read().get(user_id).map_or(0, HashMap::len)
    }

    /// Close and remove every session idle for longer than `max_idle`.
    /// Returns how many were evicted.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let mut evicted = Vec::new();
        {
            let mut sessions = self.sessions.write();
            sessions.retain(|_, user| {
                user.retain(|_, conn| {
                    if conn.idle_for() > max_idle {
                        evicted.push(conn.clone());
                        false
                    } else {
                        true
                    }
                });
                !user.is_empty()
            });
        }

        for conn in &evicted {
            info!(
                connection_id = %conn.id(),
                user_id = %conn.user_id(),
                idle_secs = conn.idle_for().as_secs(),
                "Evicting idle session"
            );
            conn.close();
        }
        evicted.len()
    }

    /// Evict idle sessions every `interval` until `cancel` fires.
    pub async fn run_reaper(
        self: Arc<Self>,
        interval: Duration,
        max_idle: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = self.reap_idle(max_idle);
                    if evicted > 0 {
                        debug!(evicted, "Idle sessions reaped");
                    }
                }
            }
        }
        debug!("Session reaper stopped");
    }

    /// Close every session and refuse new ones. Later calls are no-ops.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<_> = self
            .sessions
            .write()
            .drain()
            .flat_map(|(_, user)| user.into_values())
            .collect();

        info!(sessions = drained.len(), "Session hub shutting down");
        for conn in drained {
            conn.close();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> HubStats {
        let sessions = self.sessions.read();
        HubStats {
            total_users: sessions.len(),
            total_connections: sessions.values().map(HashMap::len).sum(),
            max_conn_per_user: self.max_conn_per_user,
        }
    }
}
