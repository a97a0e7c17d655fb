//! CLI argument definitions for the coordinator daemon.

use std::path::PathBuf;

use clap::Parser;

/// CSF Coordinator — replication control plane of the Consumer Storage
/// Fabric.
#[derive(Parser, Debug)]
#[command(
    name = "csf-coordinator",
    version,
    about = "CSF Coordinator — encrypted chunk placement, healing, and reaping"
)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "coordinator.toml", env = "CSF_CONFIG")]
    pub config: PathBuf,

    /// Override the staging directory from the config file
    #[arg(long, env = "CSF_STAGING_DIR")]
    pub staging_dir: Option<String>,

    /// Validate the configuration and exit
    #[arg(long, default_value_t = false)]
    pub check_config: bool,
}
