//! Minimal process bootstrap: enough CLI parsing to produce a runnable
//! binary. Not a general-purpose config framework — no subcommands, no
//! interactive prompts, no config file.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::common::{PeerInfo, Timing, DEFAULT_ELECTION_TIMEOUT_MS, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_LEADER_TIMEOUT_MS};
use crate::error::ClusterError;

#[derive(Debug, Clone)]
pub struct Config {
    pub self_id: u64,
    pub listen_host: IpAddr,
    pub listen_port: u16,
    pub seed_peers: Vec<PeerInfo>,
    pub timing: Timing,
    pub log_dir: PathBuf,
}

impl Config {
    /// Parses `--id`, `--host`, `--port`, `--log-dir`, `--heartbeat-ms`,
    /// `--leader-timeout-ms`, `--election-timeout-ms`, and repeated
    /// `--seed id:host:port` flags. Returns `Err(ClusterError::Usage)` on
    /// bad input rather than panicking — the caller decides how to report it.
    pub fn from_args<I: Iterator<Item = String>>(mut args: I) -> Result<Config, ClusterError> {
        let _argv0 = args.next();
        let mut self_id = None;
        let mut listen_host: IpAddr = "0.0.0.0".parse().unwrap();
        let mut listen_port = None;
        let mut seed_peers = Vec::new();
        let mut log_dir = PathBuf::from("./data");
        let mut heartbeat_ms = DEFAULT_HEARTBEAT_INTERVAL_MS;
        let mut leader_timeout_ms = DEFAULT_LEADER_TIMEOUT_MS;
        let mut election_timeout_ms = DEFAULT_ELECTION_TIMEOUT_MS;

        while let Some(flag) = args.next() {
            let value = || args_next_value(&flag, args.next());
            match flag.as_str() {
                "--id" => self_id = Some(value()?.parse().map_err(|_| usage_error(&flag))?),
                "--host" => listen_host = value()?.parse().map_err(|_| usage_error(&flag))?,
                "--port" => listen_port = Some(value()?.parse().map_err(|_| usage_error(&flag))?),
                "--log-dir" => log_dir = PathBuf::from(value()?),
                "--heartbeat-ms" => heartbeat_ms = value()?.parse().map_err(|_| usage_error(&flag))?,
                "--leader-timeout-ms" => leader_timeout_ms = value()?.parse().map_err(|_| usage_error(&flag))?,
                "--election-timeout-ms" => election_timeout_ms = value()?.parse().map_err(|_| usage_error(&flag))?,
                "--seed" => seed_peers.push(parse_seed(&value()?)?),
                other => return Err(usage_error(other)),
            }
        }

        Ok(Config {
            self_id: self_id.ok_or_else(|| usage_error("--id is required"))?,
            listen_host,
            listen_port: listen_port.ok_or_else(|| usage_error("--port is required"))?,
            seed_peers,
            timing: Timing {
                heartbeat_interval: Duration::from_millis(heartbeat_ms),
                leader_timeout: Duration::from_millis(leader_timeout_ms),
                election_timeout: Duration::from_millis(election_timeout_ms),
                ..Timing::default()
            },
            log_dir,
        })
    }
}

fn args_next_value(flag: &str, v: Option<String>) -> Result<String, ClusterError> {
    v.ok_or_else(|| usage_error(&format!("{flag} requires a value")))
}

fn usage_error(detail: &str) -> ClusterError {
    ClusterError::Usage(format!("usage: chatline --id N --port P [--host H] [--seed id:host:port ...]: {detail}"))
}

fn parse_seed(s: &str) -> Result<PeerInfo, ClusterError> {
    let mut parts = s.splitn(3, ':');
    let id = parts.next().and_then(|p| p.parse().ok());
    let host = parts.next().and_then(|p| p.parse::<IpAddr>().ok());
    let port = parts.next().and_then(|p| p.parse().ok());
    match (id, host, port) {
        (Some(peer_id), Some(host), Some(port)) => Ok(PeerInfo::new(peer_id, host, port)),
        _ => Err(usage_error(&format!("malformed --seed '{s}', expected id:host:port"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> impl Iterator<Item = String> {
        std::iter::once("chatline".to_string()).chain(v.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_minimal_config() {
        let cfg = Config::from_args(args(&["--id", "3", "--port", "7000"])).unwrap();
        assert_eq!(cfg.self_id, 3);
        assert_eq!(cfg.listen_port, 7000);
        assert!(cfg.seed_peers.is_empty());
    }

    #[test]
    fn parses_seeds_and_overrides() {
        let cfg = Config::from_args(args(&[
            "--id", "1", "--port", "7000", "--seed", "2:127.0.0.1:7001", "--seed", "3:127.0.0.1:7002",
            "--heartbeat-ms", "100",
        ]))
        .unwrap();
        assert_eq!(cfg.seed_peers.len(), 2);
        assert_eq!(cfg.seed_peers[0].peer_id, 2);
        assert_eq!(cfg.timing.heartbeat_interval, Duration::from_millis(100));
    }

    #[test]
    fn missing_id_is_an_error() {
        assert!(Config::from_args(args(&["--port", "7000"])).is_err());
    }

    #[test]
    fn malformed_seed_is_an_error() {
        assert!(Config::from_args(args(&["--id", "1", "--port", "1", "--seed", "nope"])).is_err());
    }
}
