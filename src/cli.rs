use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "montop",
    version,
    about = "A terminal top for MongoDB servers: live operations, status and replication."
)]
pub struct CliArgs {
    /// Servers to poll, by configured name or host:port address
    pub hosts: Vec<String>,

    /// Refresh interval in milliseconds
    #[arg(long, default_value_t = 1_000)]
    pub refresh_ms: u64,

    /// Config file path (default: montop.yaml, then ~/.config/montop/)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Username for servers without configured credentials
    #[arg(short, long)]
    pub username: Option<String>,

    /// Password for servers without configured credentials
    #[arg(short, long)]
    pub password: Option<String>,

    /// Automatically kill operations running longer than this many seconds
    #[arg(short = 'K', long, value_name = "SECONDS")]
    pub auto_kill: Option<u64>,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, default_value = "info")]
    pub log_filter: String,

    /// Shell binary used to talk to the servers
    #[arg(long, default_value = "mongosh")]
    pub shell_bin: String,
}
