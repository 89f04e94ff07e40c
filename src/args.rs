use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file (default: sentinel.toml)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Backend API address
    #[arg(long)]
    pub vault_addr: Option<String>,

    /// Cluster namespace holding the controller's persisted secrets
    #[arg(long)]
    pub namespace: Option<String>,

    /// Base directory of the encrypted secret file trees
    #[arg(long)]
    pub base_path: Option<PathBuf>,

    /// Poll interval between health checks (e.g. 60s)
    #[arg(long)]
    pub check_interval: Option<String>,

    /// Run a single reconcile pass and exit (disable the poll loop)
    #[arg(long)]
    pub oneshot: bool,
}
