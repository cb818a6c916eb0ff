use std::sync::Arc;

use crate::webrtc::SessionManager;

/// Application-wide state shared across handlers
pub struct AppState {
    /// WHEP session manager
    pub sessions: Arc<SessionManager>,
    /// Whether the listener terminates TLS
    https: bool,
}

impl AppState {
    pub fn new(sessions: Arc<SessionManager>, https: bool) -> Arc<Self> {
        Arc::new(Self { sessions, https })
    }

    /// Scheme used in resource `Location` headers
    pub fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }
}
