//! Connection lifecycle: TLS, device authentication and application launch.

use std::fmt;

use log::{debug, warn};

use crate::cast::session::AppSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    TlsConnected,
    Authenticated,
    AppStarted,
    ConnectionDead,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, TlsConnected)
                | (TlsConnected, Authenticated)
                | (Authenticated, AppStarted)
                | (AppStarted, Authenticated)
                | (ConnectionDead, Disconnected)
        ) || (next == ConnectionDead && self != ConnectionDead)
    }

    pub fn is_dead(self) -> bool {
        self == ConnectionState::ConnectionDead
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::TlsConnected => "tls-connected",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::AppStarted => "app-started",
            ConnectionState::ConnectionDead => "connection-dead",
        };
        f.write_str(label)
    }
}

/// Owns the connection state and the launched application session.
///
/// The application session is present exactly while the state is
/// `AppStarted`; every mutation goes through a named transition.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMachine {
    state: ConnectionState,
    app: Option<AppSession>,
    launch_pending: bool,
    launch_attempts: u8,
}

impl ConnectionMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn app(&self) -> Option<&AppSession> {
        self.app.as_ref()
    }

    pub fn app_mut(&mut self) -> Option<&mut AppSession> {
        self.app.as_mut()
    }

    fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            debug!(
                "ConnectionMachine: ignoring transition {} -> {}",
                self.state, next
            );
            return false;
        }
        debug!("ConnectionMachine: {} -> {}", self.state, next);
        self.state = next;
        true
    }

    pub fn tls_connected(&mut self) -> bool {
        self.transition(ConnectionState::TlsConnected)
    }

    pub fn authenticated(&mut self) -> bool {
        if self.state != ConnectionState::TlsConnected {
            return false;
        }
        self.launch_pending = false;
        self.launch_attempts = 0;
        self.transition(ConnectionState::Authenticated)
    }

    pub fn app_started(&mut self, app: AppSession) -> bool {
        if app.transport_id().is_empty() || !self.transition(ConnectionState::AppStarted) {
            return false;
        }
        self.launch_pending = false;
        self.app = Some(app);
        true
    }

    /// Drops back to `Authenticated`, returning the session that went away.
    pub fn app_lost(&mut self) -> Option<AppSession> {
        if self.state != ConnectionState::AppStarted {
            return None;
        }
        self.transition(ConnectionState::Authenticated);
        self.app.take()
    }

    pub fn dead(&mut self) -> bool {
        if !self.transition(ConnectionState::ConnectionDead) {
            return false;
        }
        self.app = None;
        self.launch_pending = false;
        true
    }

    /// Full reset before a new connection attempt.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether a LAUNCH may be sent now without exceeding `max_attempts`.
    pub fn should_launch(&self, max_attempts: u8) -> bool {
        self.state == ConnectionState::Authenticated
            && !self.launch_pending
            && self.launch_attempts < max_attempts
    }

    pub fn launch_exhausted(&self, max_attempts: u8) -> bool {
        !self.launch_pending && self.launch_attempts >= max_attempts
    }

    pub fn launch_sent(&mut self) {
        self.launch_pending = true;
        self.launch_attempts = self.launch_attempts.saturating_add(1);
    }

    pub fn launch_failed(&mut self) {
        if !self.launch_pending {
            warn!("ConnectionMachine: launch error without a pending launch");
        }
        self.launch_pending = false;
    }

    pub fn launch_pending(&self) -> bool {
        self.launch_pending
    }
}
