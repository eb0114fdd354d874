use std::collections::{BTreeMap, BTreeSet};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Window};
use crate::error::{OrchestratorError, TmuxError};
use crate::process::{self, Reaper};
use crate::tmux::{Reconciler, TmuxClient, WindowTarget};

/// Timing knobs for launch and shutdown sequencing
#[derive(Debug, Clone)]
pub struct Settings {
    /// Pause after each launched window that sets no `wait` of its own
    pub default_wait: Duration,
    /// Readiness check attempts before a batch launch is abandoned
    pub max_check_attempts: u32,
    /// Attempt `n` sleeps `n * check_interval` before running the check
    pub check_interval: Duration,
    /// Pause between stop and launch on relaunch, and before re-init
    pub settle_delay: Duration,
    /// Time Ctrl-C gets before pane processes are signalled
    pub interrupt_grace: Duration,
    /// Time SIGTERM gets before SIGKILL
    pub kill_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_wait: Duration::ZERO,
            max_check_attempts: 16,
            check_interval: Duration::from_secs(1),
            settle_delay: Duration::from_secs(1),
            interrupt_grace: Duration::from_secs(1),
            kill_grace: process::KILL_GRACE,
        }
    }
}

/// How a batch launch ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Completed,
    /// The named window never passed its readiness check; later windows were not launched
    Aborted { window: String },
}

/// Launches, stops and inspects the configured windows of one session.
///
/// Every method takes `&self`: the only mutable state is each window's
/// atomic `running` flag. Callers that mutate (launch/stop/kill) are expected
/// to be serialized by the control loop in `app`.
pub struct Orchestrator {
    config: Config,
    tmux: TmuxClient,
    reconciler: Reconciler,
    reaper: Reaper,
    settings: Settings,
}

impl Orchestrator {
    pub fn new(config: Config, tmux: TmuxClient, settings: Settings) -> Self {
        Self {
            reconciler: Reconciler::new(tmux.clone()),
            reaper: Reaper::new(settings.interrupt_grace, settings.kill_grace),
            config,
            tmux,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn find(&self, name: &str) -> Result<(&Window, WindowTarget), OrchestratorError> {
        let window = self
            .config
            .window(name)
            .ok_or_else(|| OrchestratorError::UnknownWindow(name.to_string()))?;
        Ok((window, WindowTarget::new(&self.config.session, &window.name)))
    }

    /// Bring the session, every window and every pane into existence
    pub async fn init(&self) -> Result<(), OrchestratorError> {
        Ok(self.reconciler.init(&self.config).await?)
    }

    /// Type each pane's command into its pane, after interrupting whatever ran there
    pub async fn launch_window(&self, name: &str) -> Result<(), OrchestratorError> {
        let (window, target) = self.find(name)?;
        info!(window = name, "launch");

        for (index, command) in window.panes.iter().enumerate() {
            let pane = target.pane(index);
            self.reconciler.ensure_pane(&pane).await?;
            self.tmux.select_pane(&pane).await?;
            self.tmux.send_interrupt(&pane).await?;
            self.tmux.send_marker(&pane, "starts new command").await?;
            if let Some(init) = &self.config.init_cmd {
                self.tmux.send_line(&pane, init).await?;
            }
            self.tmux.send_line(&pane, command).await?;
        }
        window.set_running(true);
        Ok(())
    }

    /// Launch every selected window in declared order.
    ///
    /// A window whose readiness check never passes stops the batch: later
    /// windows are not launched, and the failing one is left as it is.
    pub async fn launch_all(&self, tags: &BTreeSet<String>) -> Result<LaunchOutcome, OrchestratorError> {
        for window in self.config.windows.iter().filter(|w| w.selected(tags)) {
            self.launch_window(&window.name).await?;

            let wait = window.wait().unwrap_or(self.settings.default_wait);
            if !wait.is_zero() {
                info!(window = %window.name, seconds = wait.as_secs_f64(), "sleep after launch");
                tokio::time::sleep(wait).await;
            }

            if let Some(check) = &window.check {
                if !self.await_ready(&window.name, check).await {
                    error!(
                        window = %window.name,
                        attempts = self.settings.max_check_attempts,
                        "window failed to come up in time, not continuing launch"
                    );
                    return Ok(LaunchOutcome::Aborted {
                        window: window.name.clone(),
                    });
                }
            }
        }
        Ok(LaunchOutcome::Completed)
    }

    async fn await_ready(&self, name: &str, check: &str) -> bool {
        let script = self.check_script(check);
        for attempt in 1..=self.settings.max_check_attempts {
            tokio::time::sleep(self.settings.check_interval * attempt).await;
            let ready = run_check(&script).await;
            info!(window = name, attempt, ready, "ran check");
            if ready {
                return true;
            }
        }
        false
    }

    fn check_script(&self, check: &str) -> String {
        match &self.config.init_cmd {
            Some(init) => format!("\n{init}\n{check}"),
            None => format!("\n{check}"),
        }
    }

    /// Interrupt every pane of the window and tear down its processes in the background
    pub async fn stop_window(&self, name: &str) -> Result<(), OrchestratorError> {
        let (window, target) = self.find(name)?;
        info!(window = name, "stop");

        self.interrupt_panes(window, &target).await?;
        let roots = self.pane_pids(&target).await?;
        self.reaper.reap(roots);
        window.set_running(false);
        Ok(())
    }

    /// Like [`Orchestrator::stop_window`], but captures the descendant pids
    /// before returning so they can still be terminated after the session
    /// itself is destroyed.
    pub async fn kill_window(&self, name: &str) -> Result<(), OrchestratorError> {
        let (window, target) = self.find(name)?;
        info!(window = name, "terminate");

        self.interrupt_panes(window, &target).await?;
        window.set_running(false);
        let roots = self.pane_pids(&target).await?;
        tokio::time::sleep(self.settings.settle_delay).await;

        let pids: BTreeSet<u32> = roots
            .iter()
            .flat_map(|root| process::discover_descendants(*root))
            .collect();
        self.reaper.reap_pids(pids);
        Ok(())
    }

    async fn interrupt_panes(&self, window: &Window, target: &WindowTarget) -> Result<(), TmuxError> {
        for index in 0..window.panes.len() {
            self.tmux.send_interrupt(&target.pane(index)).await?;
        }
        Ok(())
    }

    /// Pane shell pids from the cached listing; no server means no panes
    async fn pane_pids(&self, target: &WindowTarget) -> Result<Vec<u32>, TmuxError> {
        match self.tmux.pane_pids(target).await {
            Ok(pids) => Ok(pids),
            Err(TmuxError::Listing { stderr, .. }) => {
                debug!(window = %target, stderr = %stderr, "no panes listed");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop every selected window, last declared first
    pub async fn stop_all(&self, tags: &BTreeSet<String>) -> Result<(), OrchestratorError> {
        for window in self.config.windows.iter().rev().filter(|w| w.selected(tags)) {
            self.stop_window(&window.name).await?;
        }
        Ok(())
    }

    /// Kill every window, last declared first, then the session itself.
    /// A window that fails to die is logged and skipped.
    pub async fn kill_all(&self) -> Result<(), OrchestratorError> {
        for window in self.config.windows.iter().rev() {
            if let Err(e) = self.kill_window(&window.name).await {
                warn!(
                    window = %window.name,
                    error = %e,
                    "there was an error shutting down, carrying on regardless"
                );
            }
        }
        info!(session = %self.config.session, "killing session");
        self.tmux.kill_session(&self.config.session).await?;
        Ok(())
    }

    /// Stop then launch, either one window or the whole tag-filtered set
    pub async fn relaunch(
        &self,
        window: Option<&str>,
        tags: &BTreeSet<String>,
    ) -> Result<LaunchOutcome, OrchestratorError> {
        match window {
            Some(name) => {
                self.stop_window(name).await?;
                self.reaper.wait_idle().await;
                tokio::time::sleep(self.settings.settle_delay).await;
                self.launch_window(name).await?;
                Ok(LaunchOutcome::Completed)
            }
            None => {
                self.stop_all(tags).await?;
                // The reaper looks up descendants late, so the old processes
                // must be gone before anything new starts in the same panes
                self.reaper.wait_idle().await;
                tokio::time::sleep(self.settings.settle_delay).await;
                self.launch_all(tags).await
            }
        }
    }

    /// Wait for background process teardown started by stop and kill
    pub async fn wait_idle(&self) {
        self.reaper.wait_idle().await;
    }

    /// Processes currently running below the window's pane shells
    pub async fn window_pids(&self, name: &str) -> Result<BTreeSet<u32>, OrchestratorError> {
        let (_, target) = self.find(name)?;
        let roots = self.pane_pids(&target).await?;
        Ok(roots
            .iter()
            .flat_map(|root| process::discover_descendants(*root))
            .collect())
    }

    pub async fn all_pids(&self) -> Result<BTreeMap<String, BTreeSet<u32>>, OrchestratorError> {
        self.tmux.invalidate().await;
        let mut all = BTreeMap::new();
        for window in &self.config.windows {
            all.insert(window.name.clone(), self.window_pids(&window.name).await?);
        }
        Ok(all)
    }

    /// Live check whether the window is up.
    ///
    /// Without any process below its panes it is not. Otherwise the readiness
    /// check decides when one is configured, and mere presence does when not.
    pub async fn is_running(&self, name: &str) -> Result<bool, OrchestratorError> {
        let (window, _) = self.find(name)?;
        if self.window_pids(name).await?.is_empty() {
            return Ok(false);
        }
        match &window.check {
            Some(check) => Ok(run_check(&self.check_script(check)).await),
            None => Ok(true),
        }
    }

    /// Bookkeeping `running` flag of every window, read without locking
    pub fn status(&self) -> BTreeMap<String, bool> {
        self.config
            .windows
            .iter()
            .map(|w| (w.name.clone(), w.running()))
            .collect()
    }

    /// [`Orchestrator::is_running`] for every window, from one pane listing.
    /// Errors count as not running.
    pub async fn live_status(&self) -> BTreeMap<String, bool> {
        self.tmux.invalidate().await;
        let mut status = BTreeMap::new();
        for window in &self.config.windows {
            let running = match self.is_running(&window.name).await {
                Ok(running) => running,
                Err(e) => {
                    warn!(window = %window.name, error = %e, "status query failed");
                    false
                }
            };
            status.insert(window.name.clone(), running);
        }
        status
    }
}

/// Run a check script with bash; only a zero exit counts as success
async fn run_check(script: &str) -> bool {
    match Command::new("bash")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(e) => {
            warn!(error = %e, "failed to run check command");
            false
        }
    }
}
