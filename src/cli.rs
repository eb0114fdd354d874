use clap::{Args, Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::remote::DEFAULT_PORT;

#[derive(Parser, Debug)]
#[command(name = "tmule")]
#[command(about = "Launch and supervise groups of commands in tmux windows")]
#[command(version)]
pub struct Cli {
    /// YAML file describing the session and its windows
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Session name, overriding the one in the config file
    #[arg(short, long, global = true, value_name = "NAME")]
    pub session: Option<String>,

    /// Seconds to wait after each launched window that sets no wait of its own
    #[arg(short = 'W', long, global = true, value_name = "SECONDS", default_value_t = 0.0)]
    pub wait: f64,

    /// Run tmux on this host over ssh
    #[arg(long, global = true, value_name = "HOST")]
    pub host: Option<String>,

    /// Skip creating the session, windows and panes before running the command
    #[arg(long, global = true)]
    pub no_init: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the configured windows and known tags
    List,
    /// Launch one window, or all windows matching the tags
    Launch(Selection),
    /// Stop one window, or all windows matching the tags
    Stop(Selection),
    /// Stop, then launch again
    Relaunch(Selection),
    /// Kill every window and the session
    Terminate,
    /// Print whether a window is up
    Running {
        #[arg(short, long, value_name = "WINDOW")]
        window: String,
    },
    /// Print the processes running below a window's panes, or below all of them
    Pids {
        #[arg(short, long, value_name = "WINDOW")]
        window: Option<String>,
    },
    /// Serve the WebSocket remote control
    Server {
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Leave the session running when the server stops
        #[arg(short, long)]
        keepalive: bool,

        /// Report live process state instead of the launch bookkeeping
        #[arg(long)]
        live_status: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct Selection {
    /// A single window; tags are ignored when given
    #[arg(short, long, value_name = "WINDOW")]
    pub window: Option<String>,

    /// Only windows carrying one of these tags
    #[arg(short, long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,
}

impl Selection {
    pub fn tag_set(&self) -> BTreeSet<String> {
        self.tags.iter().cloned().collect()
    }
}
