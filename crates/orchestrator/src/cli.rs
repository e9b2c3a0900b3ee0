use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

#[derive(Clone, Debug, Args)]
pub struct Config {
    #[arg(
        long,
        long_help = "Directory holding the cvd tools, downloaded artifacts, user artifacts and device runtimes",
        env = "CVD_ORCHESTRATOR_DATA_DIRECTORY",
        default_value_os_t = PathBuf::from("/var/lib/cuttlefish-common"),
    )]
    pub data_directory: PathBuf,

    #[arg(
        long,
        long_help = "Unprivileged user the cvd tool is executed as",
        env = "CVD_ORCHESTRATOR_CVD_USER",
        default_value = "_cvd-executor"
    )]
    pub cvd_user: String,

    #[arg(
        long,
        long_help = "Build ID the cvd and fetch_cvd tools are downloaded from",
        env = "CVD_ORCHESTRATOR_CVD_BUILD_ID",
        default_value = "11525000"
    )]
    pub cvd_build_id: String,

    #[arg(
        long,
        long_help = "Build target the cvd and fetch_cvd tools are downloaded from",
        env = "CVD_ORCHESTRATOR_CVD_BUILD_TARGET",
        default_value = "aosp_cf_x86_64_phone-trunk_staging-userdebug"
    )]
    pub cvd_build_target: String,

    #[arg(
        long,
        long_help = "Android Build API base URL",
        env = "CVD_ORCHESTRATOR_ANDROID_BUILD_URL",
        default_value = "https://androidbuildinternal.googleapis.com"
    )]
    pub android_build_url: String,

    #[arg(
        long,
        long_help = "JSON-RPC listen address",
        env = "CVD_ORCHESTRATOR_JSON_RPC_LISTEN_ADDR",
        default_value = "127.0.0.1:2080"
    )]
    pub json_rpc_listen_addr: SocketAddr,

    #[arg(
        long,
        long_help = "Seconds `cvd start` may take before it is interrupted",
        env = "CVD_ORCHESTRATOR_CVD_START_TIMEOUT_SECS",
        default_value_t = 120
    )]
    pub cvd_start_timeout_secs: u64,

    #[arg(
        long,
        long_help = "Seconds a single `fetch_cvd` run may take before it is interrupted",
        env = "CVD_ORCHESTRATOR_FETCH_TIMEOUT_SECS",
        default_value_t = 1800
    )]
    pub fetch_timeout_secs: u64,

    #[arg(
        long,
        long_help = "Upper bound in seconds for a single waitOperation call. 0 waits without a limit.",
        env = "CVD_ORCHESTRATOR_OPERATION_WAIT_SECS",
        default_value_t = 120
    )]
    pub operation_wait_secs: u64,
}

impl Config {
    pub fn cvd_start_timeout(&self) -> Duration {
        Duration::from_secs(self.cvd_start_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn operation_wait(&self) -> Duration {
        Duration::from_secs(self.operation_wait_secs)
    }
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the orchestrator.
    Run {
        #[command(flatten)]
        config: Config,
    },

    /// Print the effective configuration.
    ShowConfig {
        #[command(flatten)]
        config: Config,
    },
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Cuttlefish host orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub subcommand: Command,
}
