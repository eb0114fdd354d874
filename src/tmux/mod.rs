mod client;
mod reconcile;
#[cfg(test)]
pub mod testing;

pub use client::TmuxClient;
#[cfg(test)]
pub use client::{CmdOutput, CommandRunner, PANE_FIELDS, WINDOW_FIELDS};
pub use reconcile::Reconciler;

use std::collections::BTreeMap;
use std::fmt;

/// Identity of a window as addressed by tmux (`session:window`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowTarget {
    pub session: String,
    pub window: String,
}

impl WindowTarget {
    pub fn new(session: impl Into<String>, window: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            window: window.into(),
        }
    }

    pub fn pane(&self, index: usize) -> PaneTarget {
        PaneTarget {
            window: self.clone(),
            index,
        }
    }
}

impl fmt::Display for WindowTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session, self.window)
    }
}

/// Identity of a pane as addressed by tmux (`session:window.index`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PaneTarget {
    pub window: WindowTarget,
    pub index: usize,
}

impl fmt::Display for PaneTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.window, self.index)
    }
}

/// One row of a tmux listing, keyed by format field name.
///
/// Fields tmux reported as empty are not stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record(BTreeMap<String, String>);

impl Record {
    /// Build a record from a tab-separated row and the field names used in `-F`
    pub fn from_row(fields: &[&str], row: &str) -> Self {
        let values = fields
            .iter()
            .zip(row.split('\t'))
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self(values)
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn pane_pid(&self) -> Option<u32> {
        self.get("pane_pid").and_then(|p| p.parse().ok())
    }
}

/// Listing of windows keyed by `session:window`
pub type WindowListing = BTreeMap<String, Record>;

/// Listing of panes keyed by `session:window.index`
pub type PaneListing = BTreeMap<String, Record>;
