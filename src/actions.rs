use std::collections::BTreeSet;
use tokio::sync::oneshot;

use crate::error::OrchestratorError;
use crate::orchestrator::LaunchOutcome;

/// Mutating commands that go through the control loop, one at a time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Launch one window, or every window selected by `tags` when `window` is `None`
    Launch {
        window: Option<String>,
        tags: BTreeSet<String>,
    },
    /// Stop one window, or every selected window in reverse order
    Stop {
        window: Option<String>,
        tags: BTreeSet<String>,
    },
    /// Stop, settle, launch
    Relaunch {
        window: Option<String>,
        tags: BTreeSet<String>,
    },
    /// Kill every window and the session, optionally recreating the layout afterwards
    Terminate { reinit: bool },
    /// Bring session, windows and panes into existence
    Init,
}

impl Action {
    pub fn launch(window: Option<String>) -> Self {
        Self::Launch {
            window,
            tags: BTreeSet::new(),
        }
    }

    pub fn launch_tag(tag: impl Into<String>) -> Self {
        Self::Launch {
            window: None,
            tags: BTreeSet::from([tag.into()]),
        }
    }

    pub fn stop(window: Option<String>) -> Self {
        Self::Stop {
            window,
            tags: BTreeSet::new(),
        }
    }

    pub fn stop_tag(tag: impl Into<String>) -> Self {
        Self::Stop {
            window: None,
            tags: BTreeSet::from([tag.into()]),
        }
    }
}

/// Result of an [`Action`]; non-launch actions complete with [`LaunchOutcome::Completed`]
pub type Reply = Result<LaunchOutcome, OrchestratorError>;

/// An action plus the channel its result goes back on
#[derive(Debug)]
pub struct Request {
    pub action: Action,
    pub reply: oneshot::Sender<Reply>,
}
