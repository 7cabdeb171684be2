use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use notify_sync::{Category, NotificationId, Priority};

#[derive(Parser, Debug)]
#[command(
    name = "notify",
    author,
    version,
    about = "Terminal client for real-time notifications",
    long_about = "Watch notifications over a STOMP/WebSocket channel (falling back to polling), \
                  or list and acknowledge them through the REST API."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to <config dir>/notify-sync/config.toml)
    #[arg(short, long, global = true, env = "NOTIFY_CONFIG")]
    pub config: Option<PathBuf>,

    /// REST API base URL
    #[arg(long, global = true, env = "NOTIFY_API_URL")]
    pub api_url: Option<String>,

    /// WebSocket endpoint of the STOMP broker
    #[arg(long, global = true, env = "NOTIFY_WS_URL")]
    pub endpoint: Option<String>,

    /// User identity announced on the channel
    #[arg(long, global = true, env = "NOTIFY_USER_ID")]
    pub user_id: Option<String>,

    /// Bearer token
    #[arg(long, global = true, env = "NOTIFY_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Pretty)]
    pub output: OutputFormat,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the sync engine and print notifications as they arrive
    Watch {
        /// Poll instead of holding a persistent channel
        #[arg(long)]
        poll: bool,

        /// Poll interval in seconds
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        interval: Option<u64>,
    },

    /// List notifications
    List {
        /// Only unread notifications
        #[arg(long, conflicts_with = "read")]
        unread: bool,

        /// Only read notifications
        #[arg(long)]
        read: bool,

        /// Filter by category
        #[arg(long = "type", value_name = "CATEGORY")]
        category: Option<Category>,

        /// Filter by priority
        #[arg(long)]
        priority: Option<Priority>,

        /// Search in title and body
        #[arg(short, long)]
        keyword: Option<String>,

        /// Page number (1-based)
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        page: u32,

        /// Page size
        #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u32).range(1..=500))]
        size: u32,
    },

    /// Print the unread count
    Unread,

    /// Mark notifications as read
    Read {
        #[arg(required = true)]
        ids: Vec<NotificationId>,
    },

    /// Mark every notification as read
    ReadAll,

    /// Delete notifications
    Delete {
        #[arg(required = true)]
        ids: Vec<NotificationId>,
    },

    /// Delete every notification
    Clear {
        /// Skip the safety check
        #[arg(long)]
        yes: bool,
    },

    /// Print the effective configuration
    Config,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Pretty,
    Json,
}
