use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use rustrecon_types::QueueStatus;

/// rustrecon: action queue and scheduler for a recon inventory
#[derive(Parser, Debug)]
#[command(name = "rustrecon", version, about = "Action queue and scheduler for network recon")]
pub struct Args {
    /// Database file (default: ~/.rustrecon/rustrecon.db)
    #[arg(long = "db", value_name = "PATH", global = true)]
    pub db: Option<PathBuf>,

    /// Config file (default: ~/.rustrecon/config.toml)
    #[arg(long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity level (use -v or -vv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Print JSON instead of aligned text
    #[arg(long = "json", global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler and workers until ctrl-c
    Run(RunArgs),

    /// Inspect and edit the action queue
    #[command(subcommand)]
    Queue(QueueCommand),

    /// List known hosts
    Hosts,

    /// Show dashboard counters
    Stats {
        /// Recompute live counters before printing
        #[arg(long = "refresh")]
        refresh: bool,
    },

    /// Inspect and sync the action catalog
    #[command(subcommand)]
    Actions(ActionsCommand),

    /// Expire overdue work, purge old rows and repair finding tables
    Maintain,
}

#[derive(ClapArgs, Debug, Default, Clone)]
pub struct RunArgs {
    /// Log what would run instead of executing actions
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Concurrent workers (overrides config)
    #[arg(long = "workers", value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: Option<u16>,

    /// MAC used as the target of global actions (overrides config)
    #[arg(long = "controller-mac", value_name = "MAC")]
    pub controller_mac: Option<String>,

    /// Seconds between scheduler ticks (overrides config)
    #[arg(long = "tick", value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub tick_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// List queue rows in display order
    List {
        /// Only show these statuses (repeatable)
        #[arg(long = "status", value_name = "STATUS", value_parser = parse_status)]
        status: Vec<QueueStatus>,
    },

    /// Next due time per action with scheduled work
    Upcoming,

    /// Peek at the item a worker would claim next
    Next,

    /// Queue an action against a host
    Enqueue {
        action: String,
        mac: String,
        ip: String,

        #[arg(long = "port", value_name = "PORT")]
        port: Option<u16>,

        #[arg(long = "priority", value_name = "N")]
        priority: Option<i32>,

        /// Defer until this epoch second instead of queueing now
        #[arg(long = "at", value_name = "SECS")]
        at: Option<i64>,
    },

    /// Cancel a scheduled, pending or running row
    Cancel { id: i64 },

    /// Attempts for one action on one host, newest first
    History {
        action: String,
        mac: String,

        #[arg(long = "port", value_name = "PORT")]
        port: Option<u16>,

        #[arg(long = "limit", value_name = "N", default_value = "20")]
        limit: usize,
    },

    /// Latest outcome of every action on a host
    Status { mac: String },
}

#[derive(Subcommand, Debug)]
pub enum ActionsCommand {
    /// List catalog entries
    List,

    /// Upsert catalog entries from a TOML file of [[action]] tables
    Sync { file: PathBuf },

    /// Enable a catalog entry
    Enable { name: String },

    /// Disable a catalog entry
    Disable { name: String },

    /// Delete a catalog entry; its queue history is kept
    Remove { name: String },
}

fn parse_status(s: &str) -> Result<QueueStatus, String> {
    s.parse::<QueueStatus>().map_err(|e| e.to_string())
}
