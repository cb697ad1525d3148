//! Activation protocol per profile type, dispatched through one
//! `ActivationStrategy` trait per connection kind instead of a single
//! function branching on type.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use crate::errors::FailoverError;
use crate::model::{ActiveConnection, ActiveConnectionState, ConnectionKind, Device, Profile};
use crate::modem_client::ModemClient;
use crate::net_client::NetClient;

/// Budget for every activation/deactivation/SIM-switch wait in this module.
pub const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[async_trait]
pub trait ActivationStrategy: Send + Sync {
    /// Brings `profile` up on `device`, returning the resulting
    /// `ActiveConnection` once it reaches `Activated`, or `None` if it
    /// failed or timed out.
    async fn activate(
        &self,
        net: &dyn NetClient,
        profile: &Profile,
        device: &Device,
    ) -> Result<Option<ActiveConnection>, FailoverError>;
}

/// Polls `net.active_connections()` until `profile_id`'s state matches
/// `wanted`, or `timeout` elapses. Returns `true` on success.
pub async fn wait_for_state(
    net: &dyn NetClient,
    profile_id: &str,
    wanted: ActiveConnectionState,
    timeout: Duration,
) -> Result<bool, FailoverError> {
    let deadline = Instant::now() + timeout;
    loop {
        let actives = net.active_connections().await?;
        if let Some(active) = actives.get(profile_id) {
            if active.state == wanted {
                return Ok(true);
            }
        } else if wanted == ActiveConnectionState::Deactivated {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Ethernet and any other non-Wi-Fi, non-cellular profile type: just
/// activate and wait.
pub struct GenericActivation;

#[async_trait]
impl ActivationStrategy for GenericActivation {
    async fn activate(
        &self,
        net: &dyn NetClient,
        profile: &Profile,
        device: &Device,
    ) -> Result<Option<ActiveConnection>, FailoverError> {
        let active = net.activate(profile, device).await?;
        if wait_for_state(net, &profile.id, ActiveConnectionState::Activated, ACTIVATION_TIMEOUT).await? {
            Ok(Some(active))
        } else {
            Ok(None)
        }
    }
}

/// Wi-Fi client: some adapters only support one active client connection at
/// a time, so any other active, non-AP Wi-Fi connection must be deactivated
/// first — regardless of which device it happens to be bound to, since the
/// conflict is adapter-wide client-mode contention, not device co-location.
pub struct WiFiClientActivation;

#[async_trait]
impl ActivationStrategy for WiFiClientActivation {
    async fn activate(
        &self,
        net: &dyn NetClient,
        profile: &Profile,
        device: &Device,
    ) -> Result<Option<ActiveConnection>, FailoverError> {
        let actives = net.active_connections().await?;
        for (other_id, other) in actives.iter() {
            if other_id == &profile.id {
                continue;
            }
            let other_profile = match net.find_profile(other_id).await? {
                Some(p) => p,
                None => continue,
            };
            if other_profile.kind != ConnectionKind::Wifi {
                continue;
            }
            let attrs = match net.profile_attributes(other_id).await {
                Ok(attrs) => attrs,
                Err(_) => continue,
            };
            if attrs.wifi_ap_mode {
                continue;
            }
            net.deactivate(other).await?;
            wait_for_state(net, other_id, ActiveConnectionState::Deactivated, ACTIVATION_TIMEOUT).await?;
        }
        GenericActivation.activate(net, profile, device).await
    }
}

/// Cellular (modem): may require deactivating whatever else is on the
/// modem device, then switching the physical SIM slot before activating.
pub struct CellularActivation<'a> {
    pub modem: &'a dyn ModemClient,
}

#[async_trait]
impl<'a> ActivationStrategy for CellularActivation<'a> {
    async fn activate(
        &self,
        net: &dyn NetClient,
        profile: &Profile,
        device: &Device,
    ) -> Result<Option<ActiveConnection>, FailoverError> {
        let actives = net.active_connections().await?;
        for (other_id, other) in actives.iter() {
            if other.interfaces.iter().any(|i| i == &device.interface_name) {
                net.deactivate(other).await?;
                if !wait_for_state(net, other_id, ActiveConnectionState::Deactivated, ACTIVATION_TIMEOUT).await? {
                    return Ok(None);
                }
            }
        }

        let mut device = device.clone();
        if profile.sim_slot != crate::model::SIM_SLOT_DEFAULT {
            let current = self.modem.primary_sim_slot(&device.udi).await?;
            if current != profile.sim_slot {
                self.modem.set_primary_sim_slot(&device.udi, profile.sim_slot).await?;
                match self.wait_for_slot(net, profile).await? {
                    Some(new_device) => device = new_device,
                    None => return Ok(None),
                }
            }
        }

        GenericActivation.activate(net, profile, &device).await
    }
}

impl<'a> CellularActivation<'a> {
    async fn wait_for_slot(
        &self,
        net: &dyn NetClient,
        profile: &Profile,
    ) -> Result<Option<Device>, FailoverError> {
        let deadline = Instant::now() + ACTIVATION_TIMEOUT;
        loop {
            if let Some(new_device) = net.find_device_for(profile).await? {
                if let Ok(slot) = self.modem.primary_sim_slot(&new_device.udi).await {
                    if slot == profile.sim_slot {
                        return Ok(Some(new_device));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem_client::FakeModemClient;
    use crate::net_client::fake::FakeNetClient;
    use crate::net_client::ProfileAttributes;

    fn device(iface: &str, udi: &str) -> Device {
        Device { interface_name: iface.into(), managed: true, udi: udi.into(), active_profile_id: None }
    }

    #[tokio::test]
    async fn generic_activation_reaches_activated() {
        let net = FakeNetClient::new();
        let profile = Profile { id: "eth-wan".into(), kind: ConnectionKind::Ethernet, sim_slot: -1 };
        let dev = device("eth0", "/dev/eth0");
        net.add_profile(profile.clone(), ProfileAttributes::default(), dev.clone());

        let result = GenericActivation.activate(&net, &profile, &dev).await.unwrap();
        let active = result.expect("activation should succeed");
        assert_eq!(active.state, ActiveConnectionState::Activated);
    }

    #[tokio::test(start_paused = true)]
    async fn generic_activation_times_out_when_never_activated() {
        let net = FakeNetClient::new();
        let profile = Profile { id: "wifi0".into(), kind: ConnectionKind::Wifi, sim_slot: -1 };
        let dev = device("wlan0", "/dev/wlan0");
        net.add_profile(profile.clone(), ProfileAttributes::default(), dev.clone());
        net.stuck_activating("wifi0");

        let result = GenericActivation.activate(&net, &profile, &dev).await.unwrap();
        assert!(result.is_none(), "activation stuck at Activating must time out, not succeed");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_state_times_out_when_target_never_reached() {
        let net = FakeNetClient::new();
        let profile = Profile { id: "wifi0".into(), kind: ConnectionKind::Wifi, sim_slot: -1 };
        let dev = device("wlan0", "/dev/wlan0");
        net.add_profile(profile.clone(), ProfileAttributes::default(), dev.clone());
        net.stuck_activating("wifi0");
        net.activate(&profile, &dev).await.unwrap();

        let reached = wait_for_state(&net, "wifi0", ActiveConnectionState::Activated, ACTIVATION_TIMEOUT)
            .await
            .unwrap();
        assert!(!reached);
    }

    #[tokio::test]
    async fn wifi_client_activation_deactivates_other_non_ap_wifi_only() {
        let net = FakeNetClient::new();

        let new_profile = Profile { id: "home-wifi-2".into(), kind: ConnectionKind::Wifi, sim_slot: -1 };
        let new_device = device("wlan0", "/dev/wlan0");
        net.add_profile(new_profile.clone(), ProfileAttributes::default(), new_device.clone());

        let old_wifi = Profile { id: "home-wifi-1".into(), kind: ConnectionKind::Wifi, sim_slot: -1 };
        net.add_profile(
            old_wifi.clone(),
            ProfileAttributes { autoconnect: true, never_default: false, wifi_ap_mode: false },
            device("wlan1", "/dev/wlan1"),
        );
        net.set_active(ActiveConnection {
            profile_id: "home-wifi-1".into(),
            state: ActiveConnectionState::Activated,
            interfaces: vec!["wlan1".into()],
        });

        let ap_wifi = Profile { id: "hotspot".into(), kind: ConnectionKind::Wifi, sim_slot: -1 };
        net.add_profile(
            ap_wifi.clone(),
            ProfileAttributes { autoconnect: true, never_default: false, wifi_ap_mode: true },
            device("wlan2", "/dev/wlan2"),
        );
        net.set_active(ActiveConnection {
            profile_id: "hotspot".into(),
            state: ActiveConnectionState::Activated,
            interfaces: vec!["wlan2".into()],
        });

        let eth = Profile { id: "eth-wan".into(), kind: ConnectionKind::Ethernet, sim_slot: -1 };
        net.add_profile(eth.clone(), ProfileAttributes::default(), device("eth0", "/dev/eth0"));
        net.set_active(ActiveConnection {
            profile_id: "eth-wan".into(),
            state: ActiveConnectionState::Activated,
            interfaces: vec!["eth0".into()],
        });

        let result = WiFiClientActivation.activate(&net, &new_profile, &new_device).await.unwrap();
        assert!(result.is_some());

        let actives = net.active_connections().await.unwrap();
        assert!(!actives.contains_key("home-wifi-1"), "other non-AP Wi-Fi client must be torn down");
        assert!(actives.contains_key("hotspot"), "AP-mode Wi-Fi must be left alone");
        assert!(actives.contains_key("eth-wan"), "ethernet must be left alone");
        assert!(actives.contains_key("home-wifi-2"));
    }

    #[tokio::test]
    async fn cellular_activation_switches_sim_slot_then_activates() {
        let net = FakeNetClient::new();
        let modem = FakeModemClient::new();
        modem.set_primary("/modem/0", 2);

        let sim2 = Profile { id: "sim2".into(), kind: ConnectionKind::Modem, sim_slot: 2 };
        net.add_profile(sim2.clone(), ProfileAttributes::default(), device("wwan0", "/modem/0"));
        net.set_active(ActiveConnection {
            profile_id: "sim2".into(),
            state: ActiveConnectionState::Activated,
            interfaces: vec!["wwan0".into()],
        });

        let sim1 = Profile { id: "sim1".into(), kind: ConnectionKind::Modem, sim_slot: 1 };
        let sim1_device = device("wwan0", "/modem/0");
        net.add_profile(sim1.clone(), ProfileAttributes::default(), sim1_device.clone());

        let strategy = CellularActivation { modem: &modem };
        let result = strategy.activate(&net, &sim1, &sim1_device).await.unwrap();
        let active = result.expect("sim1 should activate after the slot switch");
        assert_eq!(active.state, ActiveConnectionState::Activated);

        assert_eq!(modem.primary_sim_slot("/modem/0").await.unwrap(), 1);
        let actives = net.active_connections().await.unwrap();
        assert!(!actives.contains_key("sim2"), "spare SIM's connection must be torn down first");
        assert!(actives.contains_key("sim1"));
    }

    #[tokio::test(start_paused = true)]
    async fn cellular_activation_gives_up_if_modem_never_reappears() {
        let net = FakeNetClient::new();
        let modem = FakeModemClient::new();
        modem.set_primary("/modem/0", 2);

        let sim1 = Profile { id: "sim1".into(), kind: ConnectionKind::Modem, sim_slot: 1 };
        let sim1_device = device("wwan0", "/modem/0");
        net.add_profile(sim1.clone(), ProfileAttributes::default(), sim1_device.clone());
        // Simulate ModemManager never recreating the device at the new slot.
        net.remove_device("sim1");

        let strategy = CellularActivation { modem: &modem };
        let result = strategy.activate(&net, &sim1, &sim1_device).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn cellular_activation_skips_slot_switch_for_sentinel() {
        let net = FakeNetClient::new();
        let modem = FakeModemClient::new();
        modem.set_primary("/modem/0", 2);

        let profile = Profile { id: "sim-auto".into(), kind: ConnectionKind::Modem, sim_slot: -1 };
        let dev = device("wwan0", "/modem/0");
        net.add_profile(profile.clone(), ProfileAttributes::default(), dev.clone());

        let strategy = CellularActivation { modem: &modem };
        let result = strategy.activate(&net, &profile, &dev).await.unwrap();
        assert!(result.is_some());
        // sim_slot == -1 must never trigger a slot switch.
        assert_eq!(modem.primary_sim_slot("/modem/0").await.unwrap(), 2);
    }
}
