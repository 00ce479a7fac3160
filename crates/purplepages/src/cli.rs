use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use purplepages_core::KindSet;

/// Command line options for the purplepages relay.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Opts {
    /// Path to a JSON config file; defaults apply when omitted.
    #[arg(long, env = "PURPLEPAGES_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the configured listen port. Port 9999 runs a one-shot
    /// sync against the configured relays and exits.
    #[arg(long)]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub cmd: Option<OptsCmd>,
}

#[derive(Debug, Subcommand)]
pub enum OptsCmd {
    /// One-shot sync with a single relay, then exit.
    Sync {
        /// Kinds to sync, comma separated (defaults to the sync kinds).
        #[arg(short, long)]
        kinds: Option<KindSet>,

        /// Pull from the relay, push to it, or both.
        #[arg(short, long, default_value = "down")]
        direction: SyncDirection,

        /// The relay to sync with.
        relay_url: String,
    },

    /// Run only the analytics workers (graph analysis and snapshots).
    Analytics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SyncDirection {
    Down,
    Up,
    Both,
}

impl SyncDirection {
    pub fn pulls(self) -> bool {
        matches!(self, SyncDirection::Down | SyncDirection::Both)
    }

    pub fn pushes(self) -> bool {
        matches!(self, SyncDirection::Up | SyncDirection::Both)
    }
}
