//! Configuration for replay nodes.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $REPLAY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/replay/config.toml
//!   3. ~/.config/replay/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::packet::{NodeId, Priority};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub identity: IdentityConfig,
    pub cache: CacheConfig,
    pub advert: AdvertConfig,
    pub replay: ReplaySettings,
    pub peers: PeersConfig,
    pub sim: SimConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Local node number. 0 = assigned by the host.
    pub node_id: u32,
    /// Router nodes are preferred when peer tables are full.
    pub is_router: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum packets holding a body. Capped at the slot count.
    pub max_cached: usize,
    /// Recently seen fingerprints remembered for duplicate detection.
    pub remember: usize,
    /// Prune proactively once cached bodies use more than this share of heap.
    pub heap_threshold_pct: u8,
    /// Never prune below this share of heap.
    pub heap_reserve_pct: u8,
    /// Prune when free heap drops below this.
    pub heap_free_min_pct: u8,
    /// Prune until free heap is back above this.
    pub heap_free_target_pct: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertConfig {
    /// Advertise after this many newly adopted packets.
    pub flush_packets: usize,
    /// Advertise pending packets after at most this long.
    pub flush_secs: u64,
    /// No advertisement before this long after boot.
    pub startup_delay_secs: u64,
    /// Fingerprints per advertisement.
    pub max_packets: usize,
    /// At or above this channel utilisation only high-priority packets move.
    pub chutil_threshold_pct: u8,
    /// Mesh priority at or above which a packet is high priority.
    pub high_priority: u8,
    /// Minimum spacing between expiry advertisements.
    pub expired_spacing_secs: u64,
    /// Throttled clients listed per advertisement.
    pub throttle_max: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySettings {
    /// Spacing between replayed packets.
    pub spacing_ms: u64,
    /// Wanted slots accepted from requests at once.
    pub max_pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    /// Servers tracked at once.
    pub servers: usize,
    /// Forget a server's state after this long without an advertisement.
    pub server_stale_secs: u64,
    /// Packets named per request.
    pub request_max_packets: usize,
    /// Outstanding requested fingerprints tracked for de-duplication.
    pub request_max_outstanding: usize,
    /// A request is considered lost after this long.
    pub request_timeout_secs: u64,
    /// Clients tracked at once.
    pub clients: usize,
    /// Requests a client may burst.
    pub client_burst: u32,
    /// One request token per client per this interval.
    pub client_rate_ms: u64,
}

/// Settings for the simulated medium in `replayd`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub nodes: usize,
    /// Frames dropped per receiver, percent.
    pub loss_pct: u8,
    /// One generated packet per node per interval.
    pub traffic_interval_ms: u64,
    /// Reported channel utilisation, percent.
    pub chutil_pct: u8,
    /// Simulated heap per node.
    pub heap_bytes: usize,
    /// Metrics printed every N seconds. 0 = never.
    pub stats_interval_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            is_router: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cached: 256,
            remember: 1024,
            heap_threshold_pct: 10,
            heap_reserve_pct: 5,
            heap_free_min_pct: 10,
            heap_free_target_pct: 15,
        }
    }
}

impl Default for AdvertConfig {
    fn default() -> Self {
        Self {
            flush_packets: 16,
            flush_secs: 20,
            startup_delay_secs: 30,
            max_packets: 64,
            chutil_threshold_pct: 35,
            high_priority: Priority::RELIABLE.value(),
            expired_spacing_secs: 10,
            throttle_max: 64,
        }
    }
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            spacing_ms: 1000,
            max_pending: 64,
        }
    }
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            servers: 8,
            server_stale_secs: 300,
            request_max_packets: 16,
            request_max_outstanding: 32,
            request_timeout_secs: 45,
            clients: 128,
            client_burst: 16,
            client_rate_ms: 1000,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            loss_pct: 20,
            traffic_interval_ms: 5_000,
            chutil_pct: 10,
            heap_bytes: 256 * 1024,
            stats_interval_secs: 900,
        }
    }
}

// ── Typed accessors ───────────────────────────────────────────────────────────

impl IdentityConfig {
    pub fn node(&self) -> NodeId {
        NodeId(self.node_id)
    }
}

impl AdvertConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn expired_spacing(&self) -> Duration {
        Duration::from_secs(self.expired_spacing_secs)
    }

    pub fn high_priority(&self) -> Priority {
        Priority::new(self.high_priority)
    }
}

impl ReplaySettings {
    pub fn spacing(&self) -> Duration {
        Duration::from_millis(self.spacing_ms)
    }
}

impl PeersConfig {
    pub fn server_stale(&self) -> Duration {
        Duration::from_secs(self.server_stale_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn client_rate(&self) -> Duration {
        Duration::from_millis(self.client_rate_ms)
    }
}

impl SimConfig {
    /// None when periodic statistics are disabled.
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("replay")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ReplayConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            ReplayConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("REPLAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ReplayConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply REPLAY_<SECTION>__<FIELD> overrides. Unparseable values are
    /// ignored.
    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn flag(v: &str) -> bool {
            v == "true" || v == "1"
        }
        macro_rules! parsed {
            ($key:literal, $field:expr) => {
                if let Some(v) = var($key) {
                    if let Ok(p) = v.parse() {
                        $field = p;
                    }
                }
            };
        }

        if let Some(v) = var("REPLAY_IDENTITY__NODE_ID") {
            let parsed = match v.strip_prefix("0x") {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => v.parse().ok(),
            };
            if let Some(id) = parsed {
                self.identity.node_id = id;
            }
        }
        if let Some(v) = var("REPLAY_IDENTITY__IS_ROUTER") {
            self.identity.is_router = flag(&v);
        }
        parsed!("REPLAY_CACHE__MAX_CACHED", self.cache.max_cached);
        parsed!("REPLAY_ADVERT__FLUSH_PACKETS", self.advert.flush_packets);
        parsed!("REPLAY_ADVERT__FLUSH_SECS", self.advert.flush_secs);
        parsed!("REPLAY_ADVERT__STARTUP_DELAY_SECS", self.advert.startup_delay_secs);
        parsed!("REPLAY_ADVERT__CHUTIL_THRESHOLD_PCT", self.advert.chutil_threshold_pct);
        parsed!("REPLAY_REPLAY__SPACING_MS", self.replay.spacing_ms);
        parsed!("REPLAY_PEERS__SERVERS", self.peers.servers);
        parsed!("REPLAY_PEERS__CLIENT_BURST", self.peers.client_burst);
        parsed!("REPLAY_SIM__NODES", self.sim.nodes);
        parsed!("REPLAY_SIM__LOSS_PCT", self.sim.loss_pct);
        parsed!("REPLAY_SIM__CHUTIL_PCT", self.sim.chutil_pct);
        parsed!("REPLAY_SIM__STATS_INTERVAL_SECS", self.sim.stats_interval_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = ReplayConfig::default();
        assert_eq!(config.cache.max_cached, 256);
        assert_eq!(config.advert.flush_packets, 16);
        assert_eq!(config.advert.flush_interval(), Duration::from_secs(20));
        assert_eq!(config.advert.high_priority(), Priority::RELIABLE);
        assert_eq!(config.peers.servers, 8);
        assert_eq!(config.peers.clients, 128);
        assert_eq!(config.replay.spacing(), Duration::from_millis(1000));
    }

    #[test]
    fn zero_stats_interval_disables_statistics() {
        let mut sim = SimConfig::default();
        sim.stats_interval_secs = 0;
        assert_eq!(sim.stats_interval(), None);
        sim.stats_interval_secs = 30;
        assert_eq!(sim.stats_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let config: ReplayConfig = toml::from_str(
            r#"
            [identity]
            is_router = true

            [advert]
            flush_packets = 4
            "#,
        )
        .unwrap();
        assert!(config.identity.is_router);
        assert_eq!(config.advert.flush_packets, 4);
        assert_eq!(config.advert.flush_secs, 20);
        assert_eq!(config.peers.request_timeout_secs, 45);
    }

    #[test]
    fn env_overrides_apply_on_top_of_file() {
        let env: HashMap<&str, &str> = [
            ("REPLAY_IDENTITY__NODE_ID", "0x0000abcd"),
            ("REPLAY_IDENTITY__IS_ROUTER", "1"),
            ("REPLAY_ADVERT__FLUSH_PACKETS", "8"),
            ("REPLAY_SIM__LOSS_PCT", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = ReplayConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.identity.node(), NodeId(0xabcd));
        assert!(config.identity.is_router);
        assert_eq!(config.advert.flush_packets, 8);
        assert_eq!(config.sim.loss_pct, SimConfig::default().loss_pct);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("replay-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("REPLAY_CONFIG", config_path.to_str().unwrap());
        }

        let path = ReplayConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = ReplayConfig::from_file(&path).expect("load should succeed");
        assert_eq!(config.cache.remember, 1024);
        assert_eq!(config.advert.max_packets, 64);

        unsafe {
            std::env::remove_var("REPLAY_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
