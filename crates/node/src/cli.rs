//! Command-line surface for the node binary.

use std::path::PathBuf;

use clap::Parser;

/// Edgemesh node — a peer in the permissionless edge-compute
/// marketplace. Advertises live capacity into the overlay DHT, brokers
/// auctions, and executes container workloads for other peers.
#[derive(Debug, Parser)]
#[command(name = "edgemesh-node", version, about)]
pub struct Cli {
    /// Address this node is reachable at.
    #[arg(long)]
    pub ip: String,

    /// Port to listen on.
    #[arg(long)]
    pub port: u16,

    /// Bootstrap node URL, e.g. http://127.0.0.1:5000. Omit to start a
    /// new ring.
    #[arg(long)]
    pub bootstrap: Option<String>,

    /// Verbose logging.
    #[arg(long)]
    pub debug: bool,

    /// Accepted for compatibility; effective capacity is derived from
    /// live hardware.
    #[arg(long = "promised_capacity")]
    pub promised_capacity: Option<u64>,

    /// Accounting journal path.
    #[arg(long, default_value = "task_accounting.log")]
    pub log_file: PathBuf,

    /// Node keypair path; created on first start.
    #[arg(long, default_value = "node_key.hex")]
    pub key_file: PathBuf,

    /// Advertised CPU price, USD per core-hour.
    #[arg(long, default_value_t = 0.01)]
    pub cpu_price: f64,

    /// Advertised RAM price, USD per GB-hour.
    #[arg(long, default_value_t = 0.002)]
    pub ram_price: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_invocation() {
        let cli = Cli::parse_from(["edgemesh-node", "--ip", "127.0.0.1", "--port", "5000"]);
        assert_eq!(cli.ip, "127.0.0.1");
        assert_eq!(cli.port, 5000);
        assert!(cli.bootstrap.is_none());
        assert!(!cli.debug);
        assert_eq!(cli.log_file, PathBuf::from("task_accounting.log"));
    }

    #[test]
    fn test_compat_promised_capacity_flag() {
        let cli = Cli::parse_from([
            "edgemesh-node",
            "--ip",
            "127.0.0.1",
            "--port",
            "5001",
            "--promised_capacity",
            "9000",
            "--bootstrap",
            "http://127.0.0.1:5000",
            "--debug",
        ]);
        assert_eq!(cli.promised_capacity, Some(9000));
        assert_eq!(cli.bootstrap.as_deref(), Some("http://127.0.0.1:5000"));
        assert!(cli.debug);
    }

    #[test]
    fn test_ip_and_port_required() {
        assert!(Cli::try_parse_from(["edgemesh-node", "--port", "5000"]).is_err());
        assert!(Cli::try_parse_from(["edgemesh-node", "--ip", "127.0.0.1"]).is_err());
    }
}
