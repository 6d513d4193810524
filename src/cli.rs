//! Command line interface for the `linkroute` binary.
//!
//! Kept free of crate imports so the build script can include it to render
//! the manual page.

use std::net::SocketAddr;

use clap::Parser;

/// Command line arguments for the `linkroute` binary.
#[derive(Debug, Parser)]
#[command(
    name = "linkroute",
    version,
    about = "Route example-protocol frames between TCP, UDP and serial links"
)]
pub struct Cli {
    /// Connection string of a port to add, e.g. `tcp://0.0.0.0:5760?srv=true`.
    #[arg(short, long = "port", value_name = "URI", required = true)]
    pub ports: Vec<String>,

    /// Router identifier used in logs.
    #[arg(long, default_value = "linkroute")]
    pub id: String,

    /// Do not relay messages between ports.
    #[arg(long)]
    pub no_broadcast: bool,

    /// Log a statistics snapshot every this many seconds (0 disables).
    #[arg(long, value_name = "SECS", default_value_t = 0)]
    pub stats_interval: u64,

    /// Serve Prometheus metrics on this address.
    #[arg(long, value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn parses_repeated_ports() {
        let cli = Cli::parse_from([
            "linkroute",
            "--port",
            "tcp://0.0.0.0:5760?srv=true",
            "-p",
            "udp://0.0.0.0:14550",
            "--no-broadcast",
        ]);
        assert_eq!(cli.ports.len(), 2);
        assert!(cli.no_broadcast);
        assert_eq!(cli.stats_interval, 0);
        assert_eq!(cli.id, "linkroute");
    }

    #[test]
    fn at_least_one_port_is_required() {
        assert!(Cli::try_parse_from(["linkroute"]).is_err());
    }
}
