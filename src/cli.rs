use std::path::PathBuf;

use clap::{ArgAction, Parser};

#[derive(Parser, Debug)]
#[command(name = "dockfleet")]
#[command(about = "Control plane for fleets of Docker-compatible container hosts")]
#[command(version)]
pub struct Args {
    /// Path to the configuration file (YAML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Override the bind address
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Override the REST port
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Override the data directory of the KV store
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Keep all state in memory (nothing survives a restart)
    #[arg(long)]
    pub ephemeral: bool,

    /// Path to a .env file loaded before startup
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clap_defaults() {
        let args = Args::parse_from(["dockfleet"]);
        assert!(args.config.is_none());
        assert_eq!(args.verbose, 0);
        assert!(!args.ephemeral);
    }

    #[test]
    fn test_clap_overrides() {
        let args = Args::parse_from([
            "dockfleet",
            "-vv",
            "--bind-addr",
            "127.0.0.1",
            "--port",
            "9000",
            "--ephemeral",
        ]);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.bind_addr.as_deref(), Some("127.0.0.1"));
        assert_eq!(args.port, Some(9000));
        assert!(args.ephemeral);
    }
}
