//! Configuration types and constants for the relay server.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use crate::ledger::LedgerConfig;

/// Queue depth of one peer's message stream.
pub(crate) const MESSAGE_STREAM_CAPACITY: usize = 32;
pub(crate) const MAINTENANCE_INTERVAL_SECS: u64 = 60;

pub(crate) const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub(crate) const DEFAULT_SEND_DEADLINE_SECS: u64 = 300;
pub(crate) const DEFAULT_CHANNEL_IDLE_SECS: u64 = 3600;

/// Blind relay pairing two peers per channel and passing their encrypted
/// messages through, plus a store for self-destructing sealed notes.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug, Default)]
#[command(name = "tandem-relay", version, about)]
pub struct Cli {
    /// HTTP server bind address [env: TANDEM_BIND] [default: 0.0.0.0:8080]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Data directory for the ban list and note database [env: TANDEM_HOME] [default: ~/.tandem]
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,

    /// Ban list file [env: TANDEM_BAN_LIST] [default: <data-dir>/banlist.json]
    #[arg(long)]
    pub ban_list: Option<PathBuf>,

    /// Note database [env: TANDEM_NOTES_DB] [default: <data-dir>/notes.sqlite3]
    #[arg(long)]
    pub notes_db: Option<PathBuf>,

    /// Strikes per day before an address is banned [env: TANDEM_MAX_STRIKES] [default: 20]
    #[arg(long)]
    pub max_strikes: Option<u32>,

    /// Requests per hour before an address is banned [env: TANDEM_MAX_USAGE_PER_HOUR] [default: 180]
    #[arg(long)]
    pub max_usage_per_hour: Option<u32>,

    /// Comma-separated addresses exempt from strikes, usage limits and bans [env: TANDEM_WHITELIST]
    #[arg(long)]
    pub whitelist: Option<String>,

    /// Seconds a send waits for the recipient to subscribe [env: TANDEM_SEND_DEADLINE_SECS] [default: 300]
    #[arg(long)]
    pub send_deadline_secs: Option<u64>,

    /// Seconds before a never-joined channel is dropped [env: TANDEM_CHANNEL_IDLE_SECS] [default: 3600]
    #[arg(long)]
    pub channel_idle_secs: Option<u64>,

    /// Comma-separated CORS origins; empty allows any [env: TANDEM_ALLOWED_ORIGINS]
    #[arg(long)]
    pub allowed_origin: Option<String>,
}

/// Runtime knobs of the HTTP surface.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upper bound on how long a send waits for the recipient's subscription.
    pub send_deadline: Duration,
    /// Age after which a channel that was never joined is swept.
    pub channel_idle: Duration,
    pub maintenance_interval: Duration,
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            send_deadline: Duration::from_secs(DEFAULT_SEND_DEADLINE_SECS),
            channel_idle: Duration::from_secs(DEFAULT_CHANNEL_IDLE_SECS),
            maintenance_interval: Duration::from_secs(MAINTENANCE_INTERVAL_SECS),
            allowed_origins: Vec::new(),
        }
    }
}

pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub notes_db: PathBuf,
    pub ledger: LedgerConfig,
    pub relay: RelayConfig,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        let data_dir = cli
            .data_dir
            .or_else(|| std::env::var("TANDEM_HOME").ok().map(PathBuf::from))
            .unwrap_or_else(|| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".tandem"))
                    .unwrap_or_else(|_| PathBuf::from(".tandem"))
            });

        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("TANDEM_BIND").ok())
            .unwrap_or_else(|| DEFAULT_BIND.to_string());

        let ban_list = cli
            .ban_list
            .or_else(|| std::env::var("TANDEM_BAN_LIST").ok().map(PathBuf::from))
            .unwrap_or_else(|| data_dir.join("banlist.json"));

        let notes_db = cli
            .notes_db
            .or_else(|| std::env::var("TANDEM_NOTES_DB").ok().map(PathBuf::from))
            .unwrap_or_else(|| data_dir.join("notes.sqlite3"));

        let defaults = LedgerConfig::default();
        let max_strikes = cli
            .max_strikes
            .or_else(|| env_parse("TANDEM_MAX_STRIKES"))
            .unwrap_or(defaults.max_strikes);
        let max_usage_per_hour = cli
            .max_usage_per_hour
            .or_else(|| env_parse("TANDEM_MAX_USAGE_PER_HOUR"))
            .unwrap_or(defaults.max_usage_per_hour);
        let whitelist = cli
            .whitelist
            .or_else(|| std::env::var("TANDEM_WHITELIST").ok())
            .map(|raw| parse_whitelist(&raw))
            .unwrap_or_default();

        let send_deadline_secs = cli
            .send_deadline_secs
            .or_else(|| env_parse("TANDEM_SEND_DEADLINE_SECS"))
            .unwrap_or(DEFAULT_SEND_DEADLINE_SECS);
        let channel_idle_secs = cli
            .channel_idle_secs
            .or_else(|| env_parse("TANDEM_CHANNEL_IDLE_SECS"))
            .unwrap_or(DEFAULT_CHANNEL_IDLE_SECS);
        let allowed_origins = cli
            .allowed_origin
            .or_else(|| std::env::var("TANDEM_ALLOWED_ORIGINS").ok())
            .map(|raw| split_list(&raw))
            .unwrap_or_default();

        Self {
            bind_addr,
            data_dir,
            notes_db,
            ledger: LedgerConfig {
                max_strikes: max_strikes.max(1),
                max_usage_per_hour: max_usage_per_hour.max(1),
                ban_list_path: Some(ban_list),
                whitelist,
                ..defaults
            },
            relay: RelayConfig {
                send_deadline: Duration::from_secs(send_deadline_secs),
                channel_idle: Duration::from_secs(channel_idle_secs),
                allowed_origins,
                ..RelayConfig::default()
            },
        }
    }
}

/// Read and parse an environment variable, ignoring it (with a warning) if
/// it does not parse.
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            crate::tlog_warn!("config: ignoring invalid {}={:?}", name, raw);
            None
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn parse_whitelist(raw: &str) -> Vec<IpAddr> {
    split_list(raw)
        .into_iter()
        .filter_map(|item| match item.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                crate::tlog_warn!("config: ignoring invalid whitelist entry {:?}", item);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_skips_garbage() {
        let list = parse_whitelist(" 127.0.0.1, nope ,::1,,");
        assert_eq!(
            list,
            vec![
                "127.0.0.1".parse::<IpAddr>().unwrap(),
                "::1".parse::<IpAddr>().unwrap()
            ]
        );
    }

    #[test]
    fn cli_values_shape_the_config() {
        let cli = Cli {
            bind: Some("127.0.0.1:9000".into()),
            data_dir: Some(PathBuf::from("/tmp/tandem-cfg")),
            max_strikes: Some(3),
            max_usage_per_hour: Some(0),
            whitelist: Some("10.0.0.1".into()),
            send_deadline_secs: Some(5),
            allowed_origin: Some("https://a.example, https://b.example".into()),
            ..Cli::default()
        };
        let config = Config::from_cli_and_env(cli);

        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.notes_db, PathBuf::from("/tmp/tandem-cfg/notes.sqlite3"));
        assert_eq!(
            config.ledger.ban_list_path,
            Some(PathBuf::from("/tmp/tandem-cfg/banlist.json"))
        );
        assert_eq!(config.ledger.max_strikes, 3);
        // Zero would ban on the first request.
        assert_eq!(config.ledger.max_usage_per_hour, 1);
        assert_eq!(config.ledger.whitelist.len(), 1);
        assert_eq!(config.relay.send_deadline, Duration::from_secs(5));
        assert_eq!(config.relay.allowed_origins.len(), 2);
    }
}
