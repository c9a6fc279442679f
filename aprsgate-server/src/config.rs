//! Gateway configuration.
//!
//! Loaded once at boot from a JSON file; hot-path components receive their
//! sections by value and treat them as immutable. Durations are humantime
//! strings (`"30s"`, `"20m"`).

use std::{
    net::{
        IpAddr,
        SocketAddr,
    },
    path::Path,
    time::Duration,
};

use serde::Deserialize;

use aprsgate_types::Callsign;

#[derive(Debug, thiserror::Error)]
#[error("configuration error")]
pub enum Error {
    Io(#[from] std::io::Error),
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The gateway's own callsign; also the server id in q-constructs and
    /// login responses.
    pub callsign: Callsign,

    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub digipeater: DigipeaterConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub aprs_is: Option<AprsIsConfig>,
    #[serde(default)]
    pub rf: Vec<RfInterfaceConfig>,
    #[serde(default)]
    pub udp: Option<UdpConfig>,
    #[serde(default)]
    pub beacon: BeaconConfig,
    #[serde(default)]
    pub acl: AclConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// The digipeater's transmit callsign, defaulting to the gateway call.
    pub fn digipeater_callsign(&self) -> Callsign {
        self.digipeater
            .callsign
            .clone()
            .unwrap_or_else(|| self.callsign.clone())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub max_clients: usize,
    /// Per-client outbound queue length; a client whose queue overflows is
    /// disconnected.
    pub client_queue_size: usize,
    #[serde(with = "humantime_serde")]
    pub login_timeout: Duration,
    /// Pacing delay between history replay lines.
    #[serde(with = "humantime_serde")]
    pub replay_pacing: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:14580".parse().expect("valid listen address"),
            max_clients: 50,
            client_queue_size: 64,
            login_timeout: Duration::from_secs(30),
            replay_pacing: Duration::from_millis(10),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DigipeaterConfig {
    pub enabled: bool,
    /// Transmit callsign; defaults to the gateway callsign.
    pub callsign: Option<Callsign>,
    /// Aliases answered in addition to the own call and `WIDEn-N`/`TRACEn-N`.
    pub aliases: Vec<String>,
    pub max_hops: usize,
    #[serde(with = "humantime_serde")]
    pub dedup_window: Duration,
    #[serde(with = "humantime_serde")]
    pub flood_window: Duration,
    /// Packets per source per flood window before dropping.
    pub max_flood_rate: usize,
    #[serde(with = "humantime_serde")]
    pub viscous_delay: Duration,
    /// Fill-in digi: answer only `WIDE1-1`.
    pub fill_in: bool,
    pub preemptive: bool,
    pub blacklist: Vec<Callsign>,
    pub whitelist: Vec<Callsign>,
    /// Drop weather packets instead of digipeating them.
    pub filter_weather: bool,
    /// Drop telemetry packets instead of digipeating them.
    pub filter_telemetry: bool,
}

impl Default for DigipeaterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            callsign: None,
            aliases: Vec::new(),
            max_hops: 2,
            dedup_window: Duration::from_secs(30),
            flood_window: Duration::from_secs(60),
            max_flood_rate: 10,
            viscous_delay: Duration::ZERO,
            fill_in: false,
            preemptive: false,
            blacklist: Vec::new(),
            whitelist: Vec::new(),
            filter_weather: false,
            filter_telemetry: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IsToRfType {
    All,
    Heard,
    MessageOnly,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub rf_to_is: bool,
    pub is_to_rf: bool,
    pub is_to_rf_type: IsToRfType,
    /// Only gate RF packets positioned within `local_range_km` of the
    /// station; packets without a position count as local.
    pub gate_local_only: bool,
    pub local_range_km: f64,
    /// IS→RF transmissions per minute.
    pub max_rf_rate: usize,
    /// Remaining-hop budget allowed on an IS→RF path.
    pub max_hops_to_rf: usize,
    #[serde(with = "humantime_serde")]
    pub heard_window: Duration,
    #[serde(with = "humantime_serde")]
    pub dedup_window: Duration,
    pub gate_messages: bool,
    pub gate_positions: bool,
    pub gate_weather: bool,
    pub gate_telemetry: bool,
    pub gate_objects: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            rf_to_is: true,
            is_to_rf: false,
            is_to_rf_type: IsToRfType::Heard,
            gate_local_only: false,
            local_range_km: 50.0,
            max_rf_rate: 6,
            max_hops_to_rf: 2,
            heard_window: Duration::from_secs(600),
            dedup_window: Duration::from_secs(30),
            gate_messages: true,
            gate_positions: true,
            gate_weather: true,
            gate_telemetry: true,
            gate_objects: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AprsIsConfig {
    #[serde(default = "default_is_server")]
    pub server: String,
    #[serde(default = "default_is_port")]
    pub port: u16,
    /// Login callsign; defaults to the gateway callsign.
    #[serde(default)]
    pub callsign: Option<Callsign>,
    /// Passcode; computed from the callsign when absent.
    #[serde(default)]
    pub passcode: Option<i32>,
    /// Server-side filter string sent with the login.
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// Send our own beacons and gated packets upstream.
    #[serde(default = "default_true")]
    pub send: bool,
    /// Software name and version announced in the login line.
    #[serde(default = "default_software")]
    pub software: String,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_is_server() -> String {
    "rotate.aprs2.net".to_owned()
}

fn default_software() -> String {
    "aprsgate".to_owned()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_owned()
}

fn default_is_port() -> u16 {
    14580
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize)]
pub struct RfInterfaceConfig {
    /// Interface name used in logs and stats.
    pub name: String,
    /// KISS-over-TCP endpoint (a hardware TNC or a soft modem).
    pub address: String,
    /// KISS port number on multi-port TNCs.
    #[serde(default)]
    pub port: u8,
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UdpConfig {
    pub listen: SocketAddr,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Fixed station position; a beacon without one is a no-fix status.
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub symbol_table: char,
    pub symbol: char,
    pub comment: String,
    /// Also send beacons to APRS-IS.
    pub to_is: bool,
    /// RF path for beacons.
    pub path: Vec<String>,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(20 * 60),
            latitude: None,
            longitude: None,
            symbol_table: '/',
            symbol: '&',
            comment: "aprsgate".to_owned(),
            to_is: true,
            path: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    pub callsign_blacklist: Vec<Callsign>,
    pub callsign_whitelist: Vec<Callsign>,
    pub ip_blacklist: Vec<IpAddr>,
    pub ip_whitelist: Vec<IpAddr>,
    pub flood_protection: bool,
    /// Packets per client per rolling minute.
    pub max_packets_per_minute: usize,
    /// Bytes per client per rolling minute.
    pub max_bytes_per_minute: usize,
    #[serde(with = "humantime_serde")]
    pub ban_duration: Duration,
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            callsign_blacklist: Vec::new(),
            callsign_whitelist: Vec::new(),
            ip_blacklist: Vec::new(),
            ip_whitelist: Vec::new(),
            flood_protection: true,
            max_packets_per_minute: 120,
            max_bytes_per_minute: 32 * 1024,
            ban_duration: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
    pub replay_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            replay_limit: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{
        Config,
        IsToRfType,
    };

    #[test]
    fn a_minimal_config_gets_the_documented_defaults() {
        let config: Config = serde_json::from_str(r#"{"callsign": "N0CALL-10"}"#).unwrap();

        assert_eq!(config.callsign.to_string(), "N0CALL-10");
        assert_eq!(config.server.max_clients, 50);
        assert_eq!(config.digipeater.max_hops, 2);
        assert_eq!(config.digipeater.viscous_delay.as_millis(), 0);
        assert!(!config.digipeater.fill_in);
        assert_eq!(config.gate.is_to_rf_type, IsToRfType::Heard);
        assert_eq!(config.gate.heard_window.as_secs(), 600);
        assert_eq!(config.history.capacity, 10_000);
        assert_eq!(config.acl.ban_duration.as_secs(), 300);
        assert!(config.aprs_is.is_none());
    }

    #[test]
    fn durations_parse_as_humantime() {
        let config: Config = serde_json::from_str(
            r#"{
                "callsign": "N0CALL",
                "digipeater": {"viscous_delay": "5s", "max_hops": 7},
                "aprs_is": {"filter": "r/35/-106/100"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.digipeater.viscous_delay.as_secs(), 5);
        assert_eq!(config.digipeater.max_hops, 7);
        let aprs_is = config.aprs_is.unwrap();
        assert_eq!(aprs_is.server, "rotate.aprs2.net");
        assert_eq!(aprs_is.filter.as_deref(), Some("r/35/-106/100"));
    }
}
