use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::actions::{Action, Reply, Request};
use crate::error::OrchestratorError;
use crate::orchestrator::{LaunchOutcome, Orchestrator};

/// The single writer: owns the command queue and runs actions in arrival order
pub struct App {
    orchestrator: Arc<Orchestrator>,
    rx: mpsc::UnboundedReceiver<Request>,
}

/// Cheap, cloneable front door to the control loop
#[derive(Clone)]
pub struct AppHandle {
    tx: mpsc::UnboundedSender<Request>,
    orchestrator: Arc<Orchestrator>,
    live_status: bool,
}

impl App {
    pub fn new(orchestrator: Arc<Orchestrator>, live_status: bool) -> (Self, AppHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = AppHandle {
            tx,
            orchestrator: orchestrator.clone(),
            live_status,
        };
        (Self { orchestrator, rx }, handle)
    }

    /// Drain the queue until every handle is dropped
    pub async fn run(mut self) {
        while let Some(Request { action, reply }) = self.rx.recv().await {
            debug!(action = ?action, "handling action");
            let result = self.handle_action(action).await;
            // The requester may have gone away; the work is done either way
            let _ = reply.send(result);
        }
        debug!("control loop finished");
    }

    pub async fn handle_action(&self, action: Action) -> Reply {
        let orch = &self.orchestrator;
        match action {
            Action::Launch { window: Some(name), .. } => {
                orch.launch_window(&name).await?;
                Ok(LaunchOutcome::Completed)
            }
            Action::Launch { window: None, tags } => orch.launch_all(&tags).await,
            Action::Stop { window: Some(name), .. } => {
                orch.stop_window(&name).await?;
                Ok(LaunchOutcome::Completed)
            }
            Action::Stop { window: None, tags } => {
                orch.stop_all(&tags).await?;
                Ok(LaunchOutcome::Completed)
            }
            Action::Relaunch { window, tags } => orch.relaunch(window.as_deref(), &tags).await,
            Action::Terminate { reinit } => {
                orch.kill_all().await?;
                if reinit {
                    tokio::time::sleep(orch.settings().settle_delay).await;
                    info!("re-initialising session");
                    orch.init().await?;
                }
                Ok(LaunchOutcome::Completed)
            }
            Action::Init => {
                orch.init().await?;
                Ok(LaunchOutcome::Completed)
            }
        }
    }
}

impl AppHandle {
    /// Queue an action and wait for it to finish
    pub async fn execute(&self, action: Action) -> Reply {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request { action, reply })
            .map_err(|_| OrchestratorError::Closed)?;
        rx.await.map_err(|_| OrchestratorError::Closed)?
    }

    /// Window status, without waiting behind queued actions
    pub async fn status(&self) -> BTreeMap<String, bool> {
        if self.live_status {
            self.orchestrator.live_status().await
        } else {
            self.orchestrator.status()
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }
}
