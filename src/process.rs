//! Process trees below tmux panes.
//!
//! A pane's shell is the root. Everything it forked (transitively) is looked
//! up fresh from the OS on every request and torn down with SIGTERM, a short
//! grace window, then SIGKILL for whatever is left.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::tasks::TaskCounter;

/// How long terminated processes get to exit before they are killed
pub const KILL_GRACE: Duration = Duration::from_secs(1);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Snapshot of the OS process table as parent pid -> child pids
fn process_table() -> HashMap<u32, Vec<u32>> {
    let mut table: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, ppid) in list_processes() {
        table.entry(ppid).or_default().push(pid);
    }
    table
}

/// `(pid, ppid)` pairs read from /proc
#[cfg(target_os = "linux")]
fn list_processes() -> Vec<(u32, u32)> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(|pid| {
            let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
            let (_, ppid) = parse_stat(&stat)?;
            Some((pid, ppid))
        })
        .collect()
}

/// `(pid, ppid)` pairs from `ps`
#[cfg(not(target_os = "linux"))]
fn list_processes() -> Vec<(u32, u32)> {
    let Ok(output) = std::process::Command::new("ps")
        .args(["-eo", "pid=,ppid="])
        .output()
    else {
        return Vec::new();
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            Some((parts.next()?.parse().ok()?, parts.next()?.parse().ok()?))
        })
        .collect()
}

/// State letter and parent pid from a `/proc/<pid>/stat` line.
///
/// The command name sits in parentheses and may itself contain spaces or
/// parentheses, so parsing starts after the last `)`.
fn parse_stat(stat: &str) -> Option<(char, u32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

/// Every process transitively forked from `root`, at the moment of the call
pub fn discover_descendants(root: u32) -> BTreeSet<u32> {
    let table = process_table();
    let mut found = BTreeSet::new();
    let mut queue = VecDeque::from([root]);

    while let Some(pid) = queue.pop_front() {
        for child in table.get(&pid).into_iter().flatten() {
            if found.insert(*child) {
                queue.push_back(*child);
            }
        }
    }
    found.remove(&root);
    found
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| parse_stat(&stat))
        .is_some_and(|(state, _)| state == 'Z')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Whether `pid` names a live process. Zombies count as dead.
pub fn is_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

/// Deliver `signal`; a process that is already gone is not an error
fn send(pid: u32, signal: Signal) -> bool {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => {
            debug!(pid, ?signal, "process already gone");
            false
        }
        Err(e) => {
            warn!(pid, ?signal, error = %e, "failed to signal process");
            false
        }
    }
}

/// What happened to each pid handed to [`terminate`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Termination {
    /// Pids SIGTERM was actually delivered to
    pub signalled: Vec<u32>,
    /// Pids observed gone within the grace window
    pub exited: Vec<u32>,
    /// Pids still alive after the grace window and sent SIGKILL
    pub killed: Vec<u32>,
}

/// SIGTERM every pid, wait up to `grace` for them to exit, SIGKILL the rest.
///
/// Survivors are not waited on after SIGKILL.
pub async fn terminate(pids: &BTreeSet<u32>, grace: Duration) -> Termination {
    let mut report = Termination::default();

    for &pid in pids {
        info!(pid, "trying to terminate");
        if send(pid, Signal::SIGTERM) {
            report.signalled.push(pid);
        }
    }

    let deadline = Instant::now() + grace;
    let mut alive: Vec<u32> = pids.iter().copied().collect();
    loop {
        alive.retain(|&pid| {
            if is_alive(pid) {
                return true;
            }
            info!(pid, "process terminated");
            report.exited.push(pid);
            false
        });

        let now = Instant::now();
        if alive.is_empty() || now >= deadline {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
    }

    for pid in alive {
        info!(pid, "killing");
        if send(pid, Signal::SIGKILL) {
            report.killed.push(pid);
        }
    }
    report
}

/// Background teardown of the process trees below pane shells.
///
/// Callers do not wait for the work, but [`Reaper::wait_idle`] does. A pane
/// shell that is already being reaped is not queued a second time, so repeated
/// stop requests cannot pile up tasks.
#[derive(Clone)]
pub struct Reaper {
    in_flight: Arc<Mutex<HashSet<u32>>>,
    tasks: TaskCounter,
    interrupt_grace: Duration,
    kill_grace: Duration,
}

impl Reaper {
    /// `interrupt_grace` is how long Ctrl-C gets to work before anything is signalled
    pub fn new(interrupt_grace: Duration, kill_grace: Duration) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tasks: TaskCounter::new(),
            interrupt_grace,
            kill_grace,
        }
    }

    /// Spawn termination of everything below `roots`. Returns `None` when every
    /// root is already being handled.
    pub fn reap(&self, roots: Vec<u32>) -> Option<JoinHandle<Termination>> {
        let roots: Vec<u32> = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            roots.into_iter().filter(|r| in_flight.insert(*r)).collect()
        };
        if roots.is_empty() {
            debug!("pane processes already being reaped");
            return None;
        }

        let this = self.clone();
        let guard = self.tasks.enter();
        Some(tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(this.interrupt_grace).await;

            let descendants: BTreeSet<u32> = roots
                .iter()
                .flat_map(|root| discover_descendants(*root))
                .collect();
            debug!(roots = ?roots, pids = ?descendants, "reaping pane processes");
            let report = terminate(&descendants, this.kill_grace).await;
            debug!(
                signalled = ?report.signalled,
                exited = ?report.exited,
                killed = ?report.killed,
                "pane processes reaped"
            );
            this.release(&roots);
            report
        }))
    }

    /// Spawn termination of an already captured set of pids, with no
    /// interrupt grace. Used when the pane shells are about to disappear.
    pub fn reap_pids(&self, pids: BTreeSet<u32>) -> Option<JoinHandle<Termination>> {
        let pids: BTreeSet<u32> = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            pids.into_iter().filter(|p| in_flight.insert(*p)).collect()
        };
        if pids.is_empty() {
            return None;
        }

        let this = self.clone();
        let guard = self.tasks.enter();
        Some(tokio::spawn(async move {
            let _guard = guard;
            let report = terminate(&pids, this.kill_grace).await;
            debug!(exited = ?report.exited, killed = ?report.killed, "captured processes reaped");
            this.release(pids.iter());
            report
        }))
    }

    /// Wait until every teardown spawned so far has signalled its processes.
    /// Dropping the runtime earlier would cancel the SIGKILL escalation.
    pub async fn wait_idle(&self) {
        let active = self.tasks.active();
        if active > 0 {
            debug!(tasks = active, "waiting for process teardown");
        }
        self.tasks.idle().await;
    }

    fn release<'a>(&self, pids: impl IntoIterator<Item = &'a u32>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        for pid in pids {
            in_flight.remove(pid);
        }
    }
}
