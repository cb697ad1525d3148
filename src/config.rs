//! Validated, immutable selection policy. Grounded on
//! `ConfigFile`/`NetworkAwareConfigFile` in `connection_manager.py`: a plain
//! JSON document loads into a `RawConfig`, which is then validated and
//! (if no explicit tiers were given) auto-derived against the live profile
//! list into a `Config`.

use std::path::Path;

use serde::Deserialize;

use crate::errors::FailoverError;
use crate::model::{ConnectionKind, Tier, TierName};
use crate::net_client::NetClient;

/// Default probe target and default sticky period, matching
/// `DEFAULT_CONNECTIVITY_CHECK_URL`/`DEFAULT_CONNECTIVITY_CHECK_PAYLOAD`/
/// `DEFAULT_STICKY_CONNECTION_PERIOD` in the original.
const DEFAULT_CHECK_URL: &str = "http://network-test.debian.org/nm";
const DEFAULT_CHECK_PAYLOAD: &str = "NetworkManager is online";
const DEFAULT_STICKY_PERIOD_S: u64 = 900;

/// Fixed well-known path the daemon reads its configuration from.
pub const CONFIG_PATH: &str = "/etc/wb-wan-failover.conf";

#[derive(Debug, Deserialize, Default)]
struct RawTiers {
    #[serde(default)]
    high: Vec<String>,
    #[serde(default)]
    medium: Vec<String>,
    #[serde(default)]
    low: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    debug: bool,
    sticky_connection_period_s: Option<u64>,
    connectivity_check_url: Option<String>,
    connectivity_check_payload: Option<String>,
    tiers: Option<RawTiers>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub debug: bool,
    pub tiers: Vec<Tier>,
    pub sticky_period_s: u64,
    pub check_url: String,
    pub expected_payload: String,
}

impl Config {
    pub fn has_connections(&self) -> bool {
        self.tiers.iter().any(|t| !t.connections.is_empty())
    }

    /// Reads and validates the configuration file, then (if no explicit
    /// tiers were present) auto-derives tiers from `net`'s live profile
    /// list, and finally filters out profiles whose device is unmanaged or
    /// missing.
    pub async fn load(path: &Path, net: &dyn NetClient) -> Result<Config, FailoverError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FailoverError::ConfigInvalid(format!("reading {}: {}", path.display(), e)))?;
        let raw: RawConfig = serde_json::from_str(&text)
            .map_err(|e| FailoverError::ConfigInvalid(format!("parsing {}: {}", path.display(), e)))?;
        Self::from_raw(raw, net).await
    }

    async fn from_raw(raw: RawConfig, net: &dyn NetClient) -> Result<Config, FailoverError> {
        let check_url = raw.connectivity_check_url.unwrap_or_else(|| DEFAULT_CHECK_URL.to_string());
        if !check_url.starts_with("http://") && !check_url.starts_with("https://") {
            return Err(FailoverError::ConfigInvalid(format!("bad connectivity URL {}", check_url)));
        }

        let expected_payload = raw
            .connectivity_check_payload
            .unwrap_or_else(|| DEFAULT_CHECK_PAYLOAD.to_string());
        if expected_payload.is_empty() {
            return Err(FailoverError::ConfigInvalid("empty connectivity payload".into()));
        }

        let sticky_period_s = raw.sticky_connection_period_s.unwrap_or(DEFAULT_STICKY_PERIOD_S);

        let tiers = match raw.tiers {
            Some(raw_tiers) if !raw_tiers.high.is_empty() || !raw_tiers.medium.is_empty() || !raw_tiers.low.is_empty() => {
                vec![
                    Tier { name: TierName::High, connections: raw_tiers.high },
                    Tier { name: TierName::Medium, connections: raw_tiers.medium },
                    Tier { name: TierName::Low, connections: raw_tiers.low },
                ]
            }
            _ => derive_default_tiers(net).await?,
        };

        let tiers = filter_unmanaged(tiers, net).await?;

        Ok(Config {
            debug: raw.debug,
            tiers,
            sticky_period_s,
            check_url,
            expected_payload,
        })
    }
}

/// Scans every live profile and buckets it by device type, matching
/// `NetworkAwareConfigFile.get_default_tiers`: only
/// `autoconnect=true, never-default=false`, managed, non-AP-mode profiles
/// are included.
async fn derive_default_tiers(net: &dyn NetClient) -> Result<Vec<Tier>, FailoverError> {
    let mut high = Vec::new();
    let mut medium = Vec::new();
    let mut low = Vec::new();

    for profile in net.list_profiles().await? {
        let attrs = match net.profile_attributes(&profile.id).await {
            Ok(attrs) => attrs,
            Err(_) => continue,
        };
        if !attrs.autoconnect || attrs.never_default {
            continue;
        }
        let device = net.find_device_for(&profile).await?;
        let managed = device.map(|d| d.managed).unwrap_or(false);
        if !managed {
            continue;
        }
        match profile.kind {
            ConnectionKind::Ethernet => high.push(profile.id),
            ConnectionKind::Wifi => {
                if attrs.wifi_ap_mode {
                    debug!("skipping AP-mode profile {}", profile.id);
                    continue;
                }
                medium.push(profile.id);
            }
            ConnectionKind::Modem => low.push(profile.id),
            ConnectionKind::Other => warn!("unrecognized profile type for {}", profile.id),
        }
    }

    Ok(vec![
        Tier { name: TierName::High, connections: high },
        Tier { name: TierName::Medium, connections: medium },
        Tier { name: TierName::Low, connections: low },
    ])
}

/// Drops any profile id whose device is unmanaged or can't be found,
/// logging each removal once (`filter_out_unmanaged_connections`).
async fn filter_unmanaged(tiers: Vec<Tier>, net: &dyn NetClient) -> Result<Vec<Tier>, FailoverError> {
    let mut result = Vec::with_capacity(tiers.len());
    for tier in tiers {
        let mut kept = Vec::with_capacity(tier.connections.len());
        for id in tier.connections {
            let profile = match net.find_profile(&id).await? {
                Some(p) => p,
                None => {
                    warn!("profile {} not found, skipping", id);
                    continue;
                }
            };
            match net.find_device_for(&profile).await? {
                Some(device) if device.managed => kept.push(id),
                Some(_) => warn!("profile {} is unmanaged, skipping", id),
                None => warn!("no device for profile {} found, skipping", id),
            }
        }
        result.push(Tier { name: tier.name, connections: kept });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Device, Profile};
    use crate::net_client::fake::FakeNetClient;
    use crate::net_client::ProfileAttributes;

    fn eth_profile() -> (Profile, ProfileAttributes, Device) {
        (
            Profile { id: "eth-wan".into(), kind: ConnectionKind::Ethernet, sim_slot: -1 },
            ProfileAttributes { autoconnect: true, never_default: false, wifi_ap_mode: false },
            Device { interface_name: "eth0".into(), managed: true, udi: "/dev/eth0".into(), active_profile_id: None },
        )
    }

    #[tokio::test]
    async fn explicit_tiers_are_kept_verbatim() {
        let net = FakeNetClient::new();
        let (p, a, d) = eth_profile();
        net.add_profile(p, a, d);

        let raw = RawConfig {
            tiers: Some(RawTiers { high: vec!["eth-wan".into()], medium: vec![], low: vec![] }),
            ..Default::default()
        };
        let config = Config::from_raw(raw, &net).await.unwrap();
        assert_eq!(config.tiers[0].connections, vec!["eth-wan".to_string()]);
        assert!(config.has_connections());
    }

    #[tokio::test]
    async fn auto_derive_buckets_by_type() {
        let net = FakeNetClient::new();
        let (p, a, d) = eth_profile();
        net.add_profile(p, a, d);
        net.add_profile(
            Profile { id: "sim1".into(), kind: ConnectionKind::Modem, sim_slot: 1 },
            ProfileAttributes { autoconnect: true, never_default: false, wifi_ap_mode: false },
            Device { interface_name: "ttyUSB0".into(), managed: true, udi: "/modem/0".into(), active_profile_id: None },
        );

        let config = Config::from_raw(RawConfig::default(), &net).await.unwrap();
        assert_eq!(config.tiers[0].connections, vec!["eth-wan".to_string()]);
        assert_eq!(config.tiers[2].connections, vec!["sim1".to_string()]);
    }

    #[tokio::test]
    async fn rejects_bad_url() {
        let net = FakeNetClient::new();
        let raw = RawConfig { connectivity_check_url: Some("ftp://x".into()), ..Default::default() };
        assert!(Config::from_raw(raw, &net).await.is_err());
    }

    #[tokio::test]
    async fn rejects_empty_payload() {
        let net = FakeNetClient::new();
        let raw = RawConfig { connectivity_check_payload: Some(String::new()), ..Default::default() };
        assert!(Config::from_raw(raw, &net).await.is_err());
    }
}
