use async_trait::async_trait;
use chrono::Local;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{PaneListing, PaneTarget, Record, WindowListing, WindowTarget};
use crate::error::TmuxError;

/// Fields requested from `list-windows`, in `-F` order
pub const WINDOW_FIELDS: &[&str] = &[
    "session_name",
    "session_id",
    "window_id",
    "window_index",
    "window_name",
    "window_panes",
    "window_active",
    "window_layout",
];

/// Fields requested from `list-panes`, in `-F` order
pub const PANE_FIELDS: &[&str] = &[
    "session_name",
    "window_name",
    "window_index",
    "pane_index",
    "pane_id",
    "pane_pid",
    "pane_active",
    "pane_current_command",
];

/// Outcome of a single tmux invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub code: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Executes one tmux command line and collects its output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> Result<CmdOutput, TmuxError>;
}

/// Runs the real tmux binary, locally or through `ssh -t <host> --`
pub struct ProcessRunner {
    program: PathBuf,
    prefix: Vec<String>,
    remote: bool,
}

impl ProcessRunner {
    /// Locate the binaries needed to reach tmux. A missing binary is fatal.
    pub fn new(host: Option<&str>) -> Result<Self, TmuxError> {
        match host {
            Some(host) => Ok(Self {
                program: locate("ssh")?,
                prefix: vec!["-t".into(), host.into(), "--".into(), "tmux".into()],
                remote: true,
            }),
            None => Ok(Self {
                program: locate("tmux")?,
                prefix: Vec::new(),
                remote: false,
            }),
        }
    }
}

fn locate(binary: &str) -> Result<PathBuf, TmuxError> {
    which::which(binary).map_err(|source| TmuxError::BinaryNotFound {
        binary: binary.to_string(),
        source,
    })
}

/// Quote an argument for the remote shell ssh hands it to
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Decode output lossily, split into lines, drop empty ones
fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, args: &[String]) -> Result<CmdOutput, TmuxError> {
        let args: Vec<String> = if self.remote {
            args.iter().map(|a| shell_quote(a)).collect()
        } else {
            args.to_vec()
        };

        let output = Command::new(&self.program)
            .args(&self.prefix)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| TmuxError::Spawn {
                command: format!("{} {}", self.program.display(), args.join(" ")),
                source,
            })?;

        Ok(CmdOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: split_lines(&output.stdout),
            stderr: split_lines(&output.stderr),
        })
    }
}

#[derive(Default)]
struct ListingCache {
    panes: Option<PaneListing>,
}

/// Client for interacting with tmux via CLI.
///
/// The pane listing is cached as scratch state for pid lookups only. Every
/// mutating command drops it, and existence checks that drive creation always
/// call [`TmuxClient::list_windows`] / [`TmuxClient::list_panes`] which re-query.
#[derive(Clone)]
pub struct TmuxClient {
    runner: Arc<dyn CommandRunner>,
    cache: Arc<Mutex<ListingCache>>,
}

impl TmuxClient {
    pub fn new(host: Option<&str>) -> Result<Self, TmuxError> {
        Ok(Self::with_runner(Arc::new(ProcessRunner::new(host)?)))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            cache: Arc::new(Mutex::new(ListingCache::default())),
        }
    }

    /// Run a tmux command and return its exit status and output lines
    pub async fn run(&self, args: &[&str]) -> Result<CmdOutput, TmuxError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        debug!(args = ?args, "tmux");
        let output = self.runner.run(&args).await?;
        debug!(code = output.code, stdout = ?output.stdout, "tmux returned");
        Ok(output)
    }

    /// Run a command that changes tmux state. Failures are logged, not raised.
    async fn mutate(&self, args: &[&str]) -> Result<CmdOutput, TmuxError> {
        self.invalidate().await;
        let output = self.run(args).await?;
        if !output.success() {
            warn!(
                command = args.first().copied().unwrap_or_default(),
                code = output.code,
                stderr = ?output.stderr,
                "tmux command failed"
            );
        }
        Ok(output)
    }

    async fn listing(&self, args: &[&str]) -> Result<Vec<String>, TmuxError> {
        let output = self.run(args).await?;
        if !output.success() {
            return Err(TmuxError::Listing {
                command: args.first().copied().unwrap_or_default().to_string(),
                code: output.code,
                stdout: output.stdout.join("\n"),
                stderr: output.stderr.join("\n"),
            });
        }
        Ok(output.stdout)
    }

    /// Names of all sessions on the server
    pub async fn list_sessions(&self) -> Result<Vec<String>, TmuxError> {
        self.listing(&["list-sessions", "-F", "#{session_name}"]).await
    }

    /// Fresh listing of every window on the server, keyed by `session:window`
    pub async fn list_windows(&self) -> Result<WindowListing, TmuxError> {
        let format = format_string(WINDOW_FIELDS);
        let rows = self.listing(&["list-windows", "-a", "-F", format.as_str()]).await?;
        let windows = parse_listing(&rows, WINDOW_FIELDS, |r| {
            Some(format!("{}:{}", r.get("session_name")?, r.get("window_name")?))
        });
        Ok(windows)
    }

    /// Fresh listing of every pane on the server, keyed by `session:window.index`
    pub async fn list_panes(&self) -> Result<PaneListing, TmuxError> {
        let format = format_string(PANE_FIELDS);
        let rows = self.listing(&["list-panes", "-a", "-F", format.as_str()]).await?;
        let panes = parse_listing(&rows, PANE_FIELDS, |r| {
            Some(format!(
                "{}:{}.{}",
                r.get("session_name")?,
                r.get("window_name")?,
                r.get("pane_index")?
            ))
        });
        self.cache.lock().await.panes = Some(panes.clone());
        Ok(panes)
    }

    /// Last pane listing, refreshed only if nothing is cached
    pub async fn cached_panes(&self) -> Result<PaneListing, TmuxError> {
        if let Some(panes) = self.cache.lock().await.panes.clone() {
            return Ok(panes);
        }
        self.list_panes().await
    }

    pub async fn invalidate(&self) {
        self.cache.lock().await.panes = None;
    }

    /// Shell pids of every pane in a window, from the cached pane listing
    pub async fn pane_pids(&self, target: &WindowTarget) -> Result<Vec<u32>, TmuxError> {
        let panes = self.cached_panes().await?;
        Ok(panes
            .values()
            .filter(|r| {
                r.get("session_name") == Some(target.session.as_str())
                    && r.get("window_name") == Some(target.window.as_str())
            })
            .filter_map(Record::pane_pid)
            .collect())
    }

    pub async fn new_session(&self, name: &str, placeholder: &str) -> Result<CmdOutput, TmuxError> {
        self.mutate(&["new-session", "-d", "-s", name, "-n", placeholder])
            .await
    }

    pub async fn set_history_limit(&self, session: &str, lines: u32) -> Result<CmdOutput, TmuxError> {
        self.mutate(&["set-option", "-t", session, "history-limit", lines.to_string().as_str()])
            .await
    }

    /// Create a window appended after the last one in the session
    pub async fn new_window(&self, target: &WindowTarget) -> Result<CmdOutput, TmuxError> {
        let session = format!("{}:", target.session);
        self.mutate(&["new-window", "-d", "-t", session.as_str(), "-n", target.window.as_str()])
            .await
    }

    pub async fn split_window(&self, target: &WindowTarget) -> Result<CmdOutput, TmuxError> {
        self.mutate(&["split-window", "-d", "-t", target.to_string().as_str()])
            .await
    }

    pub async fn select_layout_tiled(&self, target: &WindowTarget) -> Result<CmdOutput, TmuxError> {
        self.mutate(&["select-layout", "-t", target.to_string().as_str(), "tiled"])
            .await
    }

    pub async fn select_pane(&self, target: &PaneTarget) -> Result<CmdOutput, TmuxError> {
        self.mutate(&["select-pane", "-t", target.to_string().as_str()]).await
    }

    pub async fn kill_session(&self, name: &str) -> Result<CmdOutput, TmuxError> {
        self.mutate(&["kill-session", "-t", name]).await
    }

    /// Send a key name such as `C-c` or `Enter`
    pub async fn send_key(&self, target: &PaneTarget, key: &str) -> Result<CmdOutput, TmuxError> {
        self.mutate(&["send-keys", "-t", target.to_string().as_str(), key])
            .await
    }

    /// Type `text` literally into the pane and press Enter
    pub async fn send_line(&self, target: &PaneTarget, text: &str) -> Result<(), TmuxError> {
        let pane = target.to_string();
        self.mutate(&["send-keys", "-t", pane.as_str(), "-l", "--", text])
            .await?;
        self.send_key(target, "Enter").await?;
        Ok(())
    }

    /// Type an operator marker line. The leading space keeps it out of shell history.
    pub async fn send_marker(&self, target: &PaneTarget, message: &str) -> Result<(), TmuxError> {
        let stamp = Local::now().format("%c");
        self.send_line(target, &format!(" # tmule {message} at {stamp}"))
            .await
    }

    /// Press Ctrl-C three times, then leave a timestamped marker in the pane
    pub async fn send_interrupt(&self, target: &PaneTarget) -> Result<(), TmuxError> {
        for _ in 0..3 {
            self.send_key(target, "C-c").await?;
        }
        self.send_marker(target, "sent Ctrl-C").await
    }
}

fn format_string(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|f| format!("#{{{f}}}"))
        .collect::<Vec<_>>()
        .join("\t")
}

/// Parse listing rows into records. The first row for a key wins.
fn parse_listing<F>(rows: &[String], fields: &[&str], key: F) -> std::collections::BTreeMap<String, Record>
where
    F: Fn(&Record) -> Option<String>,
{
    let mut listing = std::collections::BTreeMap::new();
    for row in rows {
        let record = Record::from_row(fields, row);
        match key(&record) {
            Some(k) => {
                listing.entry(k).or_insert(record);
            }
            None => debug!(row = %row, "skipping listing row without identity"),
        }
    }
    listing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::testing::FakeTmux;

    #[test]
    fn test_format_string() {
        assert_eq!(
            format_string(&["session_name", "window_name"]),
            "#{session_name}\t#{window_name}"
        );
    }

    #[test]
    fn test_parse_listing_first_match_wins() {
        let rows = vec![
            "robot\t$1\t@1\t0\tnav\t1\t1\tabc".to_string(),
            "robot\t$1\t@2\t1\tnav\t2\t0\tdef".to_string(),
            "robot\t$1\t@3\t2\tcore\t1\t0\tghi".to_string(),
        ];
        let listing = parse_listing(&rows, WINDOW_FIELDS, |r| {
            Some(format!("{}:{}", r.get("session_name")?, r.get("window_name")?))
        });
        assert_eq!(listing.len(), 2);
        assert_eq!(listing["robot:nav"].get("window_id"), Some("@1"));
        assert_eq!(listing["robot:core"].get("window_index"), Some("2"));
    }

    #[test]
    fn test_split_lines_filters_empty() {
        assert_eq!(split_lines(b"one\n\ntwo\n"), vec!["one", "two"]);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("#{a}\t#{b}"), "'#{a}\t#{b}'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_listing_failure_carries_output() {
        let fake = FakeTmux::new();
        let client = TmuxClient::with_runner(fake.clone());
        // no sessions yet, so listing fails like "no server running"
        let err = client.list_windows().await.unwrap_err();
        match err {
            TmuxError::Listing { code, stderr, .. } => {
                assert_eq!(code, 1);
                assert!(stderr.contains("no server running"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_pane_listing_keys() {
        let fake = FakeTmux::new();
        fake.add_window("robot", "nav", 2);
        let client = TmuxClient::with_runner(fake.clone());
        let panes = client.list_panes().await.unwrap();
        assert!(panes.contains_key("robot:nav.0"));
        assert!(panes.contains_key("robot:nav.1"));
        assert!(panes["robot:nav.1"].pane_pid().is_some());
    }

    #[tokio::test]
    async fn test_cache_invalidated_by_mutation() {
        let fake = FakeTmux::new();
        fake.add_window("robot", "nav", 1);
        let client = TmuxClient::with_runner(fake.clone());

        client.list_panes().await.unwrap();
        let listings = fake.count("list-panes");
        client.pane_pids(&WindowTarget::new("robot", "nav")).await.unwrap();
        assert_eq!(fake.count("list-panes"), listings);

        client.split_window(&WindowTarget::new("robot", "nav")).await.unwrap();
        let pids = client.pane_pids(&WindowTarget::new("robot", "nav")).await.unwrap();
        assert_eq!(fake.count("list-panes"), listings + 1);
        assert_eq!(pids.len(), 2);
    }

    #[tokio::test]
    async fn test_interrupt_sequence() {
        let fake = FakeTmux::new();
        fake.add_window("robot", "nav", 1);
        let client = TmuxClient::with_runner(fake.clone());
        client
            .send_interrupt(&WindowTarget::new("robot", "nav").pane(0))
            .await
            .unwrap();

        let keys = fake.sent_keys("robot:nav.0");
        assert_eq!(&keys[..3], &["C-c", "C-c", "C-c"]);
        assert!(keys[3].starts_with(" # tmule sent Ctrl-C at "));
        assert_eq!(keys[4], "Enter");
    }
}
