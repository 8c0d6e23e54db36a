use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nodegate")]
#[command(about = "Admit hosts into managed clusters and reconcile them with live Kubernetes state")]
#[command(version)]
pub struct Args {
    /// Path to the nodegate config file (YAML); defaults apply if omitted
    #[arg(value_name = "CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Override the bind address from the config file
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Override the listen port from the config file
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Path to a .env file for loading the kube token
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}
