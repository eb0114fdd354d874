use tracing::{debug, info};

use super::{PaneListing, PaneTarget, TmuxClient, WindowListing, WindowTarget};
use crate::config::Config;
use crate::error::{ReconcileError, TmuxError};

/// Scrollback kept for every window in a managed session
pub const HISTORY_LIMIT: u32 = 1_000_000;

/// Name of the window a new session is created with
const PLACEHOLDER_WINDOW: &str = "tmule";

/// Brings sessions, windows and panes into existence. Never deletes anything.
///
/// Every existence check re-queries tmux: creation is driven by absence, so a
/// stale listing could skip a needed creation or attempt a duplicate one.
#[derive(Clone)]
pub struct Reconciler {
    tmux: TmuxClient,
}

impl Reconciler {
    pub fn new(tmux: TmuxClient) -> Self {
        Self { tmux }
    }

    /// A failing listing means no server (and so nothing) exists yet
    async fn fresh_sessions(&self) -> Result<Vec<String>, ReconcileError> {
        match self.tmux.list_sessions().await {
            Ok(sessions) => Ok(sessions),
            Err(TmuxError::Listing { .. }) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn fresh_windows(&self) -> Result<WindowListing, ReconcileError> {
        match self.tmux.list_windows().await {
            Ok(windows) => Ok(windows),
            Err(TmuxError::Listing { .. }) => Ok(WindowListing::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn fresh_panes(&self) -> Result<PaneListing, ReconcileError> {
        match self.tmux.list_panes().await {
            Ok(panes) => Ok(panes),
            Err(TmuxError::Listing { .. }) => Ok(PaneListing::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Create the session with a placeholder window if tmux does not report it.
    /// Returns whether it was created.
    pub async fn ensure_session(&self, name: &str) -> Result<bool, ReconcileError> {
        if self.fresh_sessions().await?.iter().any(|s| s == name) {
            debug!(session = name, "found running session");
            return Ok(false);
        }

        info!(session = name, "starting new session");
        let output = self.tmux.new_session(name, PLACEHOLDER_WINDOW).await?;
        if !output.success() {
            return Err(ReconcileError::CreateFailed {
                target: name.to_string(),
                reason: output.stderr.join("; "),
            });
        }
        self.tmux.set_history_limit(name, HISTORY_LIMIT).await?;
        Ok(true)
    }

    /// Append the window to its session if absent. Returns whether it was created.
    pub async fn ensure_window(&self, target: &WindowTarget) -> Result<bool, ReconcileError> {
        if self.fresh_windows().await?.contains_key(&target.to_string()) {
            debug!(window = %target, "window already exists");
            return Ok(false);
        }

        self.ensure_session(&target.session).await?;
        info!(window = %target, "creating window");
        let output = self.tmux.new_window(target).await?;
        if !output.success() {
            return Err(ReconcileError::CreateFailed {
                target: target.to_string(),
                reason: output.stderr.join("; "),
            });
        }
        Ok(true)
    }

    /// Split the window until the requested pane index exists.
    ///
    /// One split only ever adds a single pane, so this loops. It gives up once
    /// `index + 1` splits have not produced the pane (e.g. a non-zero
    /// `pane-base-index`).
    pub async fn ensure_pane(&self, target: &PaneTarget) -> Result<(), ReconcileError> {
        let key = target.to_string();
        let mut splits = 0;

        while !self.fresh_panes().await?.contains_key(&key) {
            if self.ensure_window(&target.window).await? {
                continue;
            }
            if splits > target.index {
                return Err(ReconcileError::PaneUnreachable { target: key, splits });
            }

            info!(pane = %target, "new pane needed");
            let output = self.tmux.split_window(&target.window).await?;
            splits += 1;
            if !output.success() {
                return Err(ReconcileError::CreateFailed {
                    target: key,
                    reason: output.stderr.join("; "),
                });
            }
            self.tmux.select_layout_tiled(&target.window).await?;
        }
        Ok(())
    }

    /// Make sure every configured window has all of its panes, tiled
    pub async fn init(&self, config: &Config) -> Result<(), ReconcileError> {
        self.ensure_session(&config.session).await?;
        for window in &config.windows {
            let target = WindowTarget::new(&config.session, &window.name);
            for index in 0..window.panes.len().max(1) {
                self.ensure_pane(&target.pane(index)).await?;
            }
            self.tmux.select_layout_tiled(&target).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Window};
    use crate::tmux::testing::FakeTmux;
    use std::sync::Arc;

    fn reconciler(fake: &Arc<FakeTmux>) -> Reconciler {
        Reconciler::new(TmuxClient::with_runner(fake.clone()))
    }

    #[tokio::test]
    async fn test_ensure_session_creates_once() {
        let fake = FakeTmux::new();
        let rec = reconciler(&fake);

        assert!(rec.ensure_session("robot").await.unwrap());
        assert!(!rec.ensure_session("robot").await.unwrap());
        assert_eq!(fake.count("new-session"), 1);
        assert_eq!(fake.count("set-option"), 1);
        assert!(fake.has_session("robot"));
    }

    #[tokio::test]
    async fn test_ensure_window_is_idempotent() {
        let fake = FakeTmux::new();
        let rec = reconciler(&fake);
        let target = WindowTarget::new("robot", "nav");

        rec.ensure_window(&target).await.unwrap();
        let created = fake.count("new-window");
        rec.ensure_window(&target).await.unwrap();

        assert_eq!(created, 1);
        assert_eq!(fake.count("new-window"), 1);
        assert_eq!(fake.count("new-session"), 1);
    }

    #[tokio::test]
    async fn test_ensure_pane_splits_until_present() {
        let fake = FakeTmux::new();
        let rec = reconciler(&fake);
        let target = WindowTarget::new("robot", "nav");

        rec.ensure_pane(&target.pane(2)).await.unwrap();
        assert_eq!(fake.pane_count("robot", "nav"), Some(3));
        assert_eq!(fake.count("split-window"), 2);
        assert_eq!(fake.count("select-layout"), 2);

        let before = fake.calls().len();
        rec.ensure_pane(&target.pane(2)).await.unwrap();
        rec.ensure_pane(&target.pane(0)).await.unwrap();
        let creating = fake.calls()[before..]
            .iter()
            .filter(|c| {
                matches!(
                    c[0].as_str(),
                    "new-session" | "new-window" | "split-window"
                )
            })
            .count();
        assert_eq!(creating, 0);
    }

    #[tokio::test]
    async fn test_ensure_pane_zero_does_not_split_new_window() {
        let fake = FakeTmux::new();
        fake.add_window("robot", "core", 1);
        let rec = reconciler(&fake);

        rec.ensure_pane(&WindowTarget::new("robot", "nav").pane(0))
            .await
            .unwrap();
        assert_eq!(fake.pane_count("robot", "nav"), Some(1));
        assert_eq!(fake.count("split-window"), 0);
    }

    #[tokio::test]
    async fn test_ensure_pane_reports_failed_split() {
        let fake = FakeTmux::new();
        fake.add_window("robot", "nav", 1);
        fake.fail_command("split-window");
        let rec = reconciler(&fake);

        let err = rec
            .ensure_pane(&WindowTarget::new("robot", "nav").pane(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::CreateFailed { .. }));
    }

    #[tokio::test]
    async fn test_init_creates_all_panes() {
        let fake = FakeTmux::new();
        let rec = reconciler(&fake);
        let config = Config::new(
            "robot",
            vec![
                Window::new("core", &["roscore"]),
                Window::new("nav", &["roslaunch nav nav.launch", "htop", "top"]),
            ],
        );

        rec.init(&config).await.unwrap();
        assert_eq!(fake.pane_count("robot", "core"), Some(1));
        assert_eq!(fake.pane_count("robot", "nav"), Some(3));

        let before = fake.calls().len();
        rec.init(&config).await.unwrap();
        assert!(fake.calls()[before..]
            .iter()
            .all(|c| c[0] != "new-window" && c[0] != "split-window"));
    }
}
