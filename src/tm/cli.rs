use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "taskmaster", version, about = "supervisord-style process supervisor")]
pub struct Args {
    /// Path to the YAML program configuration
    #[arg(short = 'c', long = "config", default_value = "configs/example.yml")]
    pub config: PathBuf,

    /// Append-only daemon log file
    #[arg(long = "log-file", default_value = "taskmaster.log")]
    pub log_file: PathBuf,

    /// Web status/log broadcast port (0 = disabled)
    #[arg(long = "web-port", default_value_t = 0)]
    pub web_port: u16,
}
