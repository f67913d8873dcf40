//! Change notifier
//!
//! Publishes session lifecycle events to any number of observers and defines
//! the refresh triggers that tear sessions down.

use tokio::sync::{broadcast, mpsc};
use tracing::trace;
use url::Url;

use crate::server::session::SessionState;
use crate::workspace::folders::{WorkspaceFolder, WorkspaceKey};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle event of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Emitted on every state transition
    StateChanged {
        key: WorkspaceKey,
        /// Resource whose request created the session
        resource_uri: Url,
        state: SessionState,
    },

    /// The connection of a running session went away without a stop request
    Closed {
        key: WorkspaceKey,
        restart_eligible: bool,
    },
}

impl SessionEvent {
    pub fn key(&self) -> &WorkspaceKey {
        match self {
            SessionEvent::StateChanged { key, .. } | SessionEvent::Closed { key, .. } => key,
        }
    }
}

/// Broadcast publisher of [`SessionEvent`]s
///
/// Publishing never blocks and never fails; events are dropped when nobody
/// listens and slow subscribers observe `Lagged`.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    sender: broadcast::Sender<SessionEvent>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SessionEvent) {
        trace!("Publishing session event: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// External change that invalidates sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// Roots were opened or closed; sessions of closed roots are removed
    WorkspaceFoldersChanged {
        added: Vec<WorkspaceFolder>,
        removed: Vec<WorkspaceKey>,
    },

    /// Server settings changed for `affected` roots, or for all when `None`
    ConfigurationChanged { affected: Option<Vec<WorkspaceKey>> },

    /// The selected interpreter changed; every session is removed
    InterpreterChanged,
}

pub type RefreshSender = mpsc::UnboundedSender<RefreshTrigger>;
pub type RefreshReceiver = mpsc::UnboundedReceiver<RefreshTrigger>;

pub fn refresh_channel() -> (RefreshSender, RefreshReceiver) {
    mpsc::unbounded_channel()
}
