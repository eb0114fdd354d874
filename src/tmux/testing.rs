//! In-memory tmux double for exercising the client, reconciler and orchestrator.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::{CmdOutput, CommandRunner, PANE_FIELDS, WINDOW_FIELDS};
use crate::error::TmuxError;

/// Pids above the kernel's `pid_max` ceiling never name a real process
const FAKE_PID_BASE: u32 = 9_000_000;

#[derive(Default)]
struct State {
    sessions: Vec<(String, Vec<(String, usize)>)>,
    calls: Vec<Vec<String>>,
    pid_overrides: HashMap<String, u32>,
    failing: HashSet<String>,
    broken: HashSet<String>,
}

/// Tracks sessions, windows and pane counts and records every command
#[derive(Default)]
pub struct FakeTmux {
    state: Mutex<State>,
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn ok(stdout: Vec<String>) -> CmdOutput {
    CmdOutput {
        code: 0,
        stdout,
        stderr: Vec::new(),
    }
}

fn fail(message: &str) -> CmdOutput {
    CmdOutput {
        code: 1,
        stdout: Vec::new(),
        stderr: vec![message.to_string()],
    }
}

impl FakeTmux {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a window with `panes` panes, creating the session if needed
    pub fn add_window(&self, session: &str, window: &str, panes: usize) {
        let mut state = self.state.lock().unwrap();
        match state.sessions.iter().position(|(s, _)| s == session) {
            Some(i) => state.sessions[i].1.push((window.to_string(), panes)),
            None => state
                .sessions
                .push((session.to_string(), vec![(window.to_string(), panes)])),
        }
    }

    /// Report `pid` as the shell of pane `session:window.index`
    pub fn set_pane_pid(&self, pane: &str, pid: u32) {
        self.state
            .lock()
            .unwrap()
            .pid_overrides
            .insert(pane.to_string(), pid);
    }

    /// Make every invocation of `command` exit non-zero
    pub fn fail_command(&self, command: &str) {
        self.state.lock().unwrap().failing.insert(command.to_string());
    }

    /// Make every invocation of `command` fail to spawn at all
    pub fn break_command(&self, command: &str) {
        self.state.lock().unwrap().broken.insert(command.to_string());
    }

    pub fn has_session(&self, session: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .any(|(s, _)| s == session)
    }

    pub fn pane_count(&self, session: &str, window: &str) -> Option<usize> {
        let state = self.state.lock().unwrap();
        state
            .sessions
            .iter()
            .find(|(s, _)| s == session)
            .and_then(|(_, windows)| windows.iter().find(|(w, _)| w == window))
            .map(|(_, panes)| *panes)
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of recorded invocations of `command`
    pub fn count(&self, command: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some(command))
            .count()
    }

    /// Keys and literal text sent to one pane, in order
    pub fn sent_keys(&self, pane: &str) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some("send-keys"))
            .filter(|c| flag(c, "-t") == Some(pane))
            .filter_map(|c| c.last().cloned())
            .collect()
    }

    /// Literal lines typed into any pane, with the pane they went to
    pub fn typed_lines(&self) -> Vec<(String, String)> {
        self.calls()
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some("send-keys"))
            .filter(|c| c.iter().any(|a| a == "-l"))
            .filter_map(|c| Some((flag(c, "-t")?.to_string(), c.last()?.clone())))
            .collect()
    }

    fn window_rows(state: &State) -> Vec<String> {
        let mut rows = Vec::new();
        for (sid, (session, windows)) in state.sessions.iter().enumerate() {
            for (index, (window, panes)) in windows.iter().enumerate() {
                let row: Vec<String> = WINDOW_FIELDS
                    .iter()
                    .map(|field| match *field {
                        "session_name" => session.clone(),
                        "session_id" => format!("${sid}"),
                        "window_id" => format!("@{sid}{index}"),
                        "window_index" => index.to_string(),
                        "window_name" => window.clone(),
                        "window_panes" => panes.to_string(),
                        "window_active" => (if index == 0 { "1" } else { "0" }).to_string(),
                        _ => String::new(),
                    })
                    .collect();
                rows.push(row.join("\t"));
            }
        }
        rows
    }

    fn pane_rows(state: &State) -> Vec<String> {
        let mut rows = Vec::new();
        let mut next_pid = FAKE_PID_BASE;
        for (session, windows) in &state.sessions {
            for (index, (window, panes)) in windows.iter().enumerate() {
                for pane in 0..*panes {
                    next_pid += 1;
                    let key = format!("{session}:{window}.{pane}");
                    let pid = state.pid_overrides.get(&key).copied().unwrap_or(next_pid);
                    let row: Vec<String> = PANE_FIELDS
                        .iter()
                        .map(|field| match *field {
                            "session_name" => session.clone(),
                            "window_name" => window.clone(),
                            "window_index" => index.to_string(),
                            "pane_index" => pane.to_string(),
                            "pane_id" => format!("%{next_pid}"),
                            "pane_pid" => pid.to_string(),
                            "pane_active" => (if pane == 0 { "1" } else { "0" }).to_string(),
                            "pane_current_command" => "bash".to_string(),
                            _ => String::new(),
                        })
                        .collect();
                    rows.push(row.join("\t"));
                }
            }
        }
        rows
    }

    fn execute(state: &mut State, args: &[String]) -> CmdOutput {
        let command = args.first().map(String::as_str).unwrap_or_default();
        if state.failing.contains(command) {
            return fail(&format!("{command}: forced failure"));
        }
        match command {
            "list-sessions" | "list-windows" | "list-panes" if state.sessions.is_empty() => {
                fail("no server running on /tmp/tmux-0/default")
            }
            "list-sessions" => ok(state.sessions.iter().map(|(s, _)| s.clone()).collect()),
            "list-windows" => ok(Self::window_rows(state)),
            "list-panes" => ok(Self::pane_rows(state)),
            "new-session" => {
                let name = flag(args, "-s").unwrap_or_default().to_string();
                let window = flag(args, "-n").unwrap_or("0").to_string();
                if state.sessions.iter().any(|(s, _)| *s == name) {
                    return fail(&format!("duplicate session: {name}"));
                }
                state.sessions.push((name, vec![(window, 1)]));
                ok(Vec::new())
            }
            "new-window" => {
                let session = flag(args, "-t").unwrap_or_default().trim_end_matches(':');
                let window = flag(args, "-n").unwrap_or_default().to_string();
                match state.sessions.iter_mut().find(|(s, _)| s == session) {
                    Some((_, windows)) => {
                        windows.push((window, 1));
                        ok(Vec::new())
                    }
                    None => fail(&format!("can't find session: {session}")),
                }
            }
            "split-window" => {
                let target = flag(args, "-t").unwrap_or_default();
                let (session, window) = target.split_once(':').unwrap_or((target, ""));
                let found = state
                    .sessions
                    .iter_mut()
                    .find(|(s, _)| s == session)
                    .and_then(|(_, windows)| windows.iter_mut().find(|(w, _)| w == window));
                match found {
                    Some((_, panes)) => {
                        *panes += 1;
                        ok(Vec::new())
                    }
                    None => fail(&format!("can't find window: {target}")),
                }
            }
            "kill-session" => {
                let name = flag(args, "-t").unwrap_or_default();
                let before = state.sessions.len();
                state.sessions.retain(|(s, _)| s != name);
                if state.sessions.len() == before {
                    fail(&format!("can't find session: {name}"))
                } else {
                    ok(Vec::new())
                }
            }
            _ => ok(Vec::new()),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeTmux {
    async fn run(&self, args: &[String]) -> Result<CmdOutput, TmuxError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(args.to_vec());
        let command = args.first().cloned().unwrap_or_default();
        if state.broken.contains(&command) {
            return Err(TmuxError::Spawn {
                command,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "broken"),
            });
        }
        Ok(Self::execute(&mut state, args))
    }
}
