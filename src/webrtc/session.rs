//! WHEP session management
//!
//! One session per resource path. A path moves through
//! `absent -> negotiating -> active -> closing -> absent`; only an active
//! session can be deleted, and a path is released only after its transport is
//! closed and every task it spawned has finished.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::capability::{CapabilitySet, MediaKind};
use super::config::{PolicyOverrides, TransportPolicy};
use super::signaling::{ConnectionState, SdpAnswer, SdpOffer};
use super::transport::{MediaTransport, TransportFactory};
use crate::error::{AppError, Result};
use crate::playout::driver::{drain_feedback, PlayoutDriver};
use crate::playout::gate::ReadyGate;
use crate::playout::source::SourceProvider;

/// Session info
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub path: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub state: ConnectionState,
    pub ready: bool,
    pub tracks: Vec<MediaKind>,
}

struct Session {
    path: String,
    id: Uuid,
    transport: Arc<dyn MediaTransport>,
    tracks: Vec<MediaKind>,
    created_at: DateTime<Utc>,
    gate: ReadyGate,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            path: self.path.clone(),
            session_id: self.id.to_string(),
            created_at: self.created_at,
            state: self.transport.current_state(),
            ready: self.gate.is_open(),
            tracks: self.tracks.clone(),
        }
    }

    /// Stop the drivers, close the transport and wait for every task
    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let result = self.transport.close().await;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        join_tasks(tasks).await;
        result
    }
}

async fn join_tasks(tasks: Vec<JoinHandle<()>>) {
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            warn!("Session task failed: {}", e);
        }
    }
}

/// Session table entry
enum Slot {
    Negotiating(Uuid),
    Active(Arc<Session>),
    Closing(Uuid),
}

/// Terminal transport state reported for a specific session
#[derive(Debug)]
struct SessionEvent {
    path: String,
    session_id: Uuid,
    state: ConnectionState,
}

/// Owns every session and the path table
pub struct SessionManager {
    factory: Arc<dyn TransportFactory>,
    sources: Arc<dyn SourceProvider>,
    capabilities: CapabilitySet,
    policy: TransportPolicy,
    sessions: Arc<RwLock<HashMap<String, Slot>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: CancellationToken,
}

impl SessionManager {
    /// Create a session manager and start its event loop
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        sources: Arc<dyn SourceProvider>,
        capabilities: CapabilitySet,
        policy: TransportPolicy,
    ) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            factory,
            sources,
            capabilities,
            policy,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Self::event_loop(
            Arc::downgrade(&manager),
            rx,
            manager.shutdown.clone(),
        ));

        manager
    }

    async fn event_loop(
        manager: Weak<Self>,
        mut rx: mpsc::UnboundedReceiver<SessionEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(manager) = manager.upgrade() else {
                break;
            };
            manager.handle_event(event).await;
        }
        debug!("Session event loop stopped");
    }

    async fn handle_event(&self, event: SessionEvent) {
        if !event.state.is_terminal() {
            return;
        }
        match self.remove_session(&event.path, Some(event.session_id)).await {
            Ok(()) => info!(
                "Session {} on {} removed after transport {}",
                event.session_id, event.path, event.state
            ),
            Err(AppError::SessionNotFound(_)) => debug!(
                "Ignoring transport {} for stale session {} on {}",
                event.state, event.session_id, event.path
            ),
            Err(e) => warn!("Failed to remove session on {}: {}", event.path, e),
        }
    }

    /// Create a session on `path` with the base policy
    pub async fn create_session(&self, path: &str, offer: SdpOffer) -> Result<SdpAnswer> {
        self.create_session_with(path, offer, &PolicyOverrides::default())
            .await
    }

    /// Create a session on `path`, applying per-request overrides
    pub async fn create_session_with(
        &self,
        path: &str,
        offer: SdpOffer,
        overrides: &PolicyOverrides,
    ) -> Result<SdpAnswer> {
        let id = Uuid::new_v4();
        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(path) {
                return Err(AppError::DuplicateSession(path.to_string()));
            }
            sessions.insert(path.to_string(), Slot::Negotiating(id));
        }

        match self.establish(path, id, offer, overrides).await {
            Ok((session, answer)) => {
                // Read the state with the slot already active: a terminal
                // event that races this is either seen here or handled after
                // the lock is released, when the slot can be found.
                let state = {
                    let mut sessions = self.sessions.write().await;
                    let state = session.transport.current_state();
                    sessions.insert(path.to_string(), Slot::Active(session));
                    state
                };
                info!("WHEP session created: {} on {}", id, path);

                // A failure reported while negotiating found no active slot
                if state.is_terminal() {
                    let _ = self.events.send(SessionEvent {
                        path: path.to_string(),
                        session_id: id,
                        state,
                    });
                }
                Ok(answer)
            }
            Err(e) => {
                let mut sessions = self.sessions.write().await;
                if matches!(sessions.get(path), Some(Slot::Negotiating(slot)) if *slot == id) {
                    sessions.remove(path);
                }
                warn!("Failed to create session on {}: {}", path, e);
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        path: &str,
        id: Uuid,
        offer: SdpOffer,
        overrides: &PolicyOverrides,
    ) -> Result<(Arc<Session>, SdpAnswer)> {
        let policy = self.policy.with_overrides(overrides);
        let transport = self.factory.build(&policy, &self.capabilities).await?;
        let gate = ReadyGate::new();
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let result = self
            .start(path, id, &policy, &transport, &gate, &shutdown, &mut tasks, offer)
            .await;

        match result {
            Ok((tracks, answer)) => Ok((
                Arc::new(Session {
                    path: path.to_string(),
                    id,
                    transport,
                    tracks,
                    created_at: Utc::now(),
                    gate,
                    shutdown,
                    tasks: Mutex::new(tasks),
                }),
                answer,
            )),
            Err(e) => {
                shutdown.cancel();
                if let Err(close_err) = transport.close().await {
                    debug!("Failed to close transport for {}: {}", path, close_err);
                }
                join_tasks(tasks).await;
                Err(e)
            }
        }
    }

    /// Attach tracks, start the gated drivers and run the offer/answer exchange
    #[allow(clippy::too_many_arguments)]
    async fn start(
        &self,
        path: &str,
        id: Uuid,
        policy: &TransportPolicy,
        transport: &Arc<dyn MediaTransport>,
        gate: &ReadyGate,
        shutdown: &CancellationToken,
        tasks: &mut Vec<JoinHandle<()>>,
        offer: SdpOffer,
    ) -> Result<(Vec<MediaKind>, SdpAnswer)> {
        let mut tracks = Vec::new();

        for &kind in &policy.media {
            let codec = self.capabilities.primary_codec(kind).ok_or_else(|| {
                AppError::CapabilityError(format!("no {} codec registered", kind))
            })?;
            let source = self.sources.open(kind)?;
            let track = transport.add_outbound_track(codec).await?;

            let label = format!("{} {}", path, kind);
            let driver = PlayoutDriver::new(
                label.clone(),
                source,
                track.sink.clone(),
                self.sources.cadence(kind),
                gate.clone(),
                shutdown.clone(),
            );
            tasks.push(tokio::spawn(async move {
                // A failed driver leaves the session up; only its track goes quiet
                match driver.run().await {
                    Ok(summary) => debug!("{} playout finished: {:?}", label, summary),
                    Err(e) => debug!("{} playout task ended with error: {}", label, e),
                }
            }));

            let feedback = track.feedback.clone();
            let drain_shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                drain_feedback(kind, feedback, drain_shutdown).await;
            }));

            tracks.push(kind);
        }

        let events = self.events.clone();
        let ready = gate.clone();
        let session_path = path.to_string();
        transport.on_state_change(Box::new(move |state| {
            info!("Session {} transport state: {}", session_path, state);
            if state == ConnectionState::Connected && ready.open() {
                info!("Session {} ready, starting playout", session_path);
            }
            if state.is_terminal() {
                let _ = events.send(SessionEvent {
                    path: session_path.clone(),
                    session_id: id,
                    state,
                });
            }
        }));

        let answer = transport.negotiate(offer).await?;
        Ok((tracks, answer))
    }

    /// Delete the active session on `path`
    pub async fn delete_session(&self, path: &str) -> Result<()> {
        self.remove_session(path, None).await
    }

    /// Close and remove the active session, optionally only if its id matches
    async fn remove_session(&self, path: &str, expected: Option<Uuid>) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let session = match sessions.get(path) {
                Some(Slot::Active(session)) if expected.map_or(true, |id| id == session.id) => {
                    session.clone()
                }
                _ => return Err(AppError::SessionNotFound(path.to_string())),
            };
            sessions.insert(path.to_string(), Slot::Closing(session.id));
            session
        };

        if let Err(e) = session.close().await {
            warn!("Error closing session {} on {}: {}", session.id, path, e);
        }

        let mut sessions = self.sessions.write().await;
        if matches!(sessions.get(path), Some(Slot::Closing(id)) if *id == session.id) {
            sessions.remove(path);
        }
        info!("WHEP session closed: {} on {}", session.id, path);
        Ok(())
    }

    /// Get info for the active session on `path`
    pub async fn get_session(&self, path: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.read().await;
        match sessions.get(path) {
            Some(Slot::Active(session)) => Some(session.info()),
            _ => None,
        }
    }

    /// List all active sessions
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter_map(|slot| match slot {
                Slot::Active(session) => Some(session.info()),
                _ => None,
            })
            .collect()
    }

    /// Number of active sessions
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|slot| matches!(slot, Slot::Active(_)))
            .count()
    }

    /// Whether `path` is held by a session in any state
    pub async fn is_occupied(&self, path: &str) -> bool {
        self.sessions.read().await.contains_key(path)
    }

    /// Stop the event loop and close every active session
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let paths: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Active(_)))
                .map(|(path, _)| path.clone())
                .collect()
        };
        for path in paths {
            if let Err(e) = self.delete_session(&path).await {
                debug!("Session on {} already gone at shutdown: {}", path, e);
            }
        }
        info!("All WHEP sessions closed");
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
