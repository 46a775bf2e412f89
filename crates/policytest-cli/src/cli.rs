use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "policytest",
    about = "Run policy behaviour tests against a live Azure subscription",
    version
)]
pub struct Cli {
    /// Harness config file. Built-in defaults are used when omitted.
    #[arg(long, env = "POLICYTEST_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Azure AD tenant. Overrides the config file.
    #[arg(long, env = "AZURE_TENANT_ID", global = true)]
    pub tenant_id: Option<String>,

    /// Subscription the tests run in. Overrides the config file.
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID", global = true)]
    pub subscription_id: Option<String>,

    /// Service principal client id.
    #[arg(long, env = "AZURE_CLIENT_ID", global = true)]
    pub client_id: Option<String>,

    /// Service principal client secret.
    #[arg(long, env = "AZURE_CLIENT_SECRET", global = true, hide_env_values = true)]
    pub client_secret: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run test groups and report the outcome of every scenario.
    Run {
        /// Group to run; repeatable. Runs every group when omitted.
        #[arg(long = "group")]
        groups: Vec<String>,

        /// Report format.
        #[arg(long, default_value = "text")]
        output: OutputFormat,
    },

    /// List the built-in groups and their scenarios.
    List,

    /// Find resources left behind by earlier runs and delete them.
    Sweep {
        /// Only consider resources created more than this many minutes ago.
        #[arg(long, default_value_t = 120)]
        older_than: u32,

        /// List stale resources without deleting anything.
        #[arg(long)]
        dry_run: bool,

        /// Report format.
        #[arg(long, default_value = "text")]
        output: OutputFormat,
    },

    /// Parse policy templates locally and describe them.
    Validate {
        /// Policy definition JSON files.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}
