use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "relay", about = "LLM API reverse proxy and gateway", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway worker (default).
    Run(RunArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the JSON configuration file.
    #[arg(long, env = "CONFIG_PATH", default_value = "config.json")]
    pub config: String,

    /// Listen port override; falls back to the config file.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Directory for the access database and body/header stores.
    #[arg(long, default_value = "data")]
    pub data_dir: String,

    /// Also write application logs to daily files under the data dir.
    #[arg(long)]
    pub log_to_file: bool,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            config: std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string()),
            port: std::env::var("PORT").ok().and_then(|p| p.parse().ok()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            data_dir: "data".to_string(),
            log_to_file: false,
        }
    }
}
