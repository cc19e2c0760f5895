//! Shared application state: the room registry and orphan reconciliation.

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::LangConfig;
use crate::error::RoomError;
use crate::naming::LABEL_ROOM_KEY;
use crate::protocol::ServiceStats;
use crate::sandbox::{ExecutionBackend, LabeledResource};

const REAP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn is_valid_room_key(room_key: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]{1,128}$").expect("room key pattern"))
        .is_match(room_key)
}

/// Registry entry of a live room.
#[derive(Debug)]
pub struct Session {
    pub cancel: CancellationToken,
    pub created_at: Instant,
}

/// Thread-safe session storage.
pub type Sessions = Arc<RwLock<HashMap<String, Session>>>;

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub killed_processes: Vec<String>,
    pub removed_networks: Vec<String>,
    pub skipped: Vec<String>,
    pub errors: Vec<String>,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Sessions,
    backend: Arc<dyn ExecutionBackend>,
    config: Arc<LangConfig>,
}

impl AppState {
    pub fn new(backend: Arc<dyn ExecutionBackend>, config: Arc<LangConfig>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            backend,
            config,
        }
    }

    pub fn backend(&self) -> Arc<dyn ExecutionBackend> {
        Arc::clone(&self.backend)
    }

    pub fn config(&self) -> Arc<LangConfig> {
        Arc::clone(&self.config)
    }

    /// Register a room. The returned token tears the session down when cancelled.
    pub async fn create_session(&self, room_key: &str) -> Result<CancellationToken, RoomError> {
        if !is_valid_room_key(room_key) {
            warn!(room_key, "Invalid room key");
            return Err(RoomError::InvalidRoomKey(room_key.to_string()));
        }

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(room_key) {
            warn!(room_key, "Room session already exists");
            return Err(RoomError::RoomExists(room_key.to_string()));
        }
        let cancel = CancellationToken::new();
        sessions.insert(
            room_key.to_string(),
            Session {
                cancel: cancel.clone(),
                created_at: Instant::now(),
            },
        );
        info!(room_key, rooms = sessions.len(), "Created session");
        Ok(cancel)
    }

    /// Unregister a room and cancel its session. Returns false if it was not registered.
    pub async fn destroy_session(&self, room_key: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.remove(room_key) {
            Some(session) => {
                session.cancel.cancel();
                info!(
                    room_key,
                    age_secs = session.created_at.elapsed().as_secs(),
                    "Deleted session"
                );
                true
            }
            None => false,
        }
    }

    pub async fn stats(&self) -> ServiceStats {
        let sessions = self.sessions.read().await;
        let mut rooms: Vec<String> = sessions.keys().cloned().collect();
        rooms.sort();
        ServiceStats { rooms }
    }

    /// Destroy every labeled process and network whose room has no session.
    ///
    /// The registry stays read-locked for the whole pass so no room can be
    /// created underneath it.
    pub async fn reconcile_orphans(&self) -> ReconcileReport {
        let sessions = self.sessions.read().await;
        let mut report = ReconcileReport::default();
        let is_orphan = |resource: &LabeledResource| {
            resource
                .room_key()
                .map_or(true, |room_key| !sessions.contains_key(room_key))
        };

        info!("Stopping unmanaged room processes");
        match self.backend.list_processes(LABEL_ROOM_KEY).await {
            Ok(processes) => {
                for process in processes {
                    if !is_orphan(&process) {
                        report.skipped.push(process.name);
                        continue;
                    }
                    info!(id = %process.id, name = %process.name, room_key = ?process.room_key(), "Killing orphan process");
                    match self.backend.kill_process(&process.id).await {
                        Ok(()) => {
                            let _ = tokio::time::timeout(
                                REAP_TIMEOUT,
                                self.backend.wait_process(&process.id),
                            )
                            .await;
                            report.killed_processes.push(process.name);
                        }
                        Err(e) if e.is_not_found() => {}
                        Err(e) => {
                            warn!(id = %process.id, error = %e, "Failed to kill orphan process");
                            report.errors.push(format!("kill {}: {}", process.name, e));
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to list processes");
                report.errors.push(format!("list processes: {}", e));
            }
        }

        info!("Removing unmanaged room networks");
        match self.backend.list_networks(LABEL_ROOM_KEY).await {
            Ok(networks) => {
                for network in networks {
                    if !is_orphan(&network) {
                        report.skipped.push(network.name);
                        continue;
                    }
                    info!(id = %network.id, name = %network.name, "Removing orphan network");
                    match self.backend.remove_network(&network.id).await {
                        Ok(()) => report.removed_networks.push(network.name),
                        Err(e) if e.is_not_found() => {}
                        Err(e) => {
                            warn!(id = %network.id, error = %e, "Failed to remove orphan network");
                            report.errors.push(format!("remove {}: {}", network.name, e));
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to list networks");
                report.errors.push(format!("list networks: {}", e));
            }
        }

        info!(
            killed = report.killed_processes.len(),
            removed = report.removed_networks.len(),
            skipped = report.skipped.len(),
            errors = report.errors.len(),
            "Reconciliation finished"
        );
        report
    }
}
