use std::path::{Path, PathBuf};
use std::time::Duration;

use purplepages_core::KindSet;
use serde::Deserialize;

/// Port that switches the binary into the one-shot sync-and-exit test mode.
pub const TEST_MODE_PORT: u16 = 9999;

/// Everything the relay recognizes, with defaults for every field so a
/// missing config file means "run with defaults".
///
/// Parsing a config *file* is the binary's job; this crate only defines the
/// shape.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayInfoConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub allowed_kinds: Option<KindSet>,
    pub sync_kinds: Option<KindSet>,
    pub sync: SyncConfig,
    pub limits: LimitsConfig,
    pub stats_password: Option<String>,
    pub trusted_sync: TrustedSyncConfig,
    pub profile_hydration: ProfileHydrationConfig,
}

impl Config {
    pub fn allowed_kinds(&self) -> KindSet {
        self.allowed_kinds.clone().unwrap_or_else(KindSet::default_allowed)
    }

    pub fn sync_kinds(&self) -> KindSet {
        self.sync_kinds.clone().unwrap_or_else(KindSet::default_sync)
    }

    /// The analytics database lives next to the event store directory.
    pub fn analytics_path(&self) -> PathBuf {
        self.storage
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("analytics.sqlite")
    }
}

/// Relay metadata served on `GET /` (NIP-11).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayInfoConfig {
    pub name: String,
    pub description: String,
    pub pubkey: Option<String>,
    pub contact: Option<String>,
    pub icon: Option<String>,
    pub supported_nips: Vec<u32>,
    pub software: String,
    pub version: String,
}

impl Default for RelayInfoConfig {
    fn default() -> Self {
        Self {
            name: "purplepages".to_owned(),
            description: "An identity relay for the nostr network.".to_owned(),
            pubkey: None,
            contact: None,
            icon: None,
            supported_nips: vec![1, 2, 11, 45, 50, 65],
            software: "https://github.com/purplepages/purplepages".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn is_test_mode(&self) -> bool {
        self.port == TEST_MODE_PORT
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Event store directory; the file lives at `<path>/events.redb`.
    pub path: PathBuf,
    /// Archive superseded contact lists, enabling follower trends.
    pub archive_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/events"),
            archive_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    /// Seed relays for historical catch-up and live subscriptions.
    pub relays: Vec<String>,
    /// Overrides the top-level `sync_kinds` when set.
    pub kinds: Option<KindSet>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            relays: vec![],
            kinds: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_subscriptions: usize,
    pub max_limit: usize,
    pub max_event_tags: usize,
    pub max_content_length: usize,
    pub events_per_day_limit: u64,
    pub min_trusted_followers: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: 20,
            max_limit: 5_000,
            max_event_tags: 500,
            max_content_length: 65_536,
            events_per_day_limit: 1_000_000,
            min_trusted_followers: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrustedSyncConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub batch_size: usize,
    pub relay_timeout_secs: u64,
}

impl Default for TrustedSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 10,
            batch_size: 50,
            relay_timeout_secs: 10,
        }
    }
}

impl TrustedSyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfileHydrationConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub batch_size: usize,
}

impl Default for ProfileHydrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            batch_size: 100,
        }
    }
}

impl ProfileHydrationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

#[cfg(test)]
mod tests {
    use purplepages_core::Kind;

    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let config: Config = serde_json::from_str("{}").expect("parses");
        assert_eq!(config.server.port, 8080);
        assert!(config.allowed_kinds().contains(Kind::RELAY_LIST));
        assert_eq!(config.limits.max_event_tags, 500);
        assert!(!config.server.is_test_mode());
    }

    #[test]
    fn partial_overrides_merge_with_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "server": {"port": 9999},
                "storage": {"path": "/var/lib/purplepages/events", "archive_enabled": true},
                "allowed_kinds": [0, 3],
                "limits": {"max_limit": 100}
            }"#,
        )
        .expect("parses");
        assert!(config.server.is_test_mode());
        assert!(config.storage.archive_enabled);
        assert!(config.allowed_kinds().contains(Kind::PROFILE));
        assert!(!config.allowed_kinds().contains(Kind::RELAY_LIST));
        assert_eq!(config.limits.max_limit, 100);
        // untouched sections keep their defaults
        assert_eq!(config.limits.max_event_tags, 500);
        assert_eq!(
            config.analytics_path(),
            PathBuf::from("/var/lib/purplepages/analytics.sqlite")
        );
    }
}
