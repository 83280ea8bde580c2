//! CLI argument parsing with clap.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "strikegated")]
#[command(author, version, about = "IP-strike enforcement daemon for per-domain proof-of-work challenges")]
pub struct Cli {
    /// Domains configuration file (JSON)
    #[arg(long, default_value = "/etc/strikegate/domains.json")]
    pub config: PathBuf,

    /// Unix socket path for front-end reports
    #[arg(long, default_value = "/var/run/strikegate/intake.sock")]
    pub socket: PathBuf,

    /// SQLite database path
    #[arg(long, default_value = "/var/lib/strikegate/strikes.db")]
    pub db: PathBuf,

    /// Metrics listen port
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Log file path
    #[arg(long, default_value = "/var/log/strikegate/strikegated.log")]
    pub log: PathBuf,

    /// Initial blacklist file (newline-JSON)
    #[arg(long, default_value = "/etc/strikegate/ip_blacklist.conf")]
    pub blacklist: PathBuf,

    /// Instance lock file
    #[arg(long, default_value = "/var/run/strikegated.lock")]
    pub lock_file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["strikegated"]);
        assert_eq!(cli.config, PathBuf::from("/etc/strikegate/domains.json"));
        assert_eq!(cli.socket, PathBuf::from("/var/run/strikegate/intake.sock"));
        assert_eq!(cli.db, PathBuf::from("/var/lib/strikegate/strikes.db"));
        assert_eq!(cli.metrics_port, 9090);
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::parse_from([
            "strikegated",
            "--config",
            "/tmp/domains.json",
            "--socket",
            "/tmp/intake.sock",
            "--db",
            "/tmp/strikes.db",
            "--metrics-port",
            "9191",
            "--log",
            "/tmp/strikegated.log",
        ]);
        assert_eq!(cli.config, PathBuf::from("/tmp/domains.json"));
        assert_eq!(cli.metrics_port, 9191);
        assert_eq!(cli.log, PathBuf::from("/tmp/strikegated.log"));
    }

    #[test]
    fn test_rejects_unknown_flag() {
        assert!(Cli::try_parse_from(["strikegated", "--bogus"]).is_err());
    }
}
