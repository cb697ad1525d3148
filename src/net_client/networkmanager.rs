//! D-Bus-backed `NetClient`, talking to `org.freedesktop.NetworkManager`
//! through the proxies in [`crate::dbus_iface`]. One struct wraps a shared
//! `dbus::nonblock::SyncConnection`, with lookups done by walking
//! `ListConnections`/`GetDevices` rather than caching, since the daemon is
//! the source of truth and profiles can be edited externally at any time.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use dbus::arg::{RefArg, Variant};
use dbus::nonblock::SyncConnection;
use dbus::Path as DbusPath;

use super::{NetClient, ProfileAttributes};
use crate::dbus_iface::{active_connection, connection, device, networkmanager, settings, SettingsMap};
use crate::errors::FailoverError;
use crate::model::{ActiveConnection, ActiveConnectionState, ConnectionKind, Device, DeviceType, Profile};

pub struct NetworkManagerClient {
    conn: Arc<SyncConnection>,
    /// Shell command used to set a route metric on pseudo-interfaces
    /// NetworkManager doesn't manage directly (ppp/wwan for cellular),
    /// mirroring `call_ifmetric` in the original — the daemon has no D-Bus
    /// call for this, only `ip route` / `ifmetric` on the command line.
    ifmetric_bin: String,
}

impl NetworkManagerClient {
    pub fn new(conn: Arc<SyncConnection>) -> Self {
        NetworkManagerClient {
            conn,
            ifmetric_bin: "ifmetric".to_string(),
        }
    }

    async fn settings_map_to_profile(&self, id: &str, path: &DbusPath<'static>) -> Result<Option<(Profile, ProfileAttributes)>, FailoverError> {
        let settings = connection::get_settings(&self.conn, path).await?;
        Ok(parse_profile(id, &settings))
    }

    async fn device_for_path(&self, path: &DbusPath<'static>) -> Result<Device, FailoverError> {
        let interface_name = device::interface(&self.conn, path).await?;
        let managed = device::managed(&self.conn, path).await?;
        let udi = device::udi(&self.conn, path).await?;
        Ok(Device {
            interface_name,
            managed,
            udi,
            active_profile_id: None,
        })
    }
}

/// Extracts the fields this crate cares about from a NetworkManager
/// settings map (`connection.id`, `connection.type`, `connection.interface-name`,
/// `connection.autoconnect`, `connection.never-default` under the wired /
/// cellular / wifi subsection as appropriate, plus `gsm.sim-slot` and
/// `802-11-wireless.mode`). Returns `None` if the map lacks a `connection.id`
/// (malformed or a slot this daemon doesn't recognize as a profile).
fn parse_profile(id: &str, settings: &SettingsMap) -> Option<(Profile, ProfileAttributes)> {
    let connection_section = settings.get("connection")?;
    let type_str = connection_section
        .get("type")
        .and_then(|v| v.0.as_str())
        .unwrap_or("");
    let kind = match type_str {
        "802-3-ethernet" => ConnectionKind::Ethernet,
        "802-11-wireless" => ConnectionKind::Wifi,
        "gsm" => ConnectionKind::Modem,
        _ => ConnectionKind::Other,
    };
    let autoconnect = connection_section
        .get("autoconnect")
        .and_then(|v| v.0.as_i64())
        .map(|v| v != 0)
        .unwrap_or(true); // NM defaults autoconnect=true when absent
    let never_default = connection_section
        .get("never-default")
        .and_then(|v| v.0.as_i64())
        .map(|v| v != 0)
        .unwrap_or(false);

    let sim_slot = settings
        .get("gsm")
        .and_then(|gsm| gsm.get("sim-slot"))
        .and_then(|v| v.0.as_i64())
        .unwrap_or(-1) as i32;

    let wifi_ap_mode = settings
        .get("802-11-wireless")
        .and_then(|w| w.get("mode"))
        .and_then(|v| v.0.as_str())
        .map(|m| m == "ap")
        .unwrap_or(false);

    Some((
        Profile {
            id: id.to_string(),
            kind,
            sim_slot,
        },
        ProfileAttributes {
            autoconnect,
            never_default,
            wifi_ap_mode,
        },
    ))
}

#[async_trait]
impl NetClient for NetworkManagerClient {
    async fn list_profiles(&self) -> Result<Vec<Profile>, FailoverError> {
        let paths = settings::list_connections(&self.conn).await?;
        let mut profiles = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = connection::get_settings(&self.conn, &path).await?;
            let id = raw
                .get("connection")
                .and_then(|c| c.get("id"))
                .and_then(|v| v.0.as_str())
                .map(|s| s.to_string());
            if let Some(id) = id {
                if let Some((profile, _)) = parse_profile(&id, &raw) {
                    profiles.push(profile);
                }
            }
        }
        Ok(profiles)
    }

    async fn profile_attributes(&self, profile_id: &str) -> Result<ProfileAttributes, FailoverError> {
        let path = self.find_connection_path(profile_id).await?;
        let (_, attrs) = self
            .settings_map_to_profile(profile_id, &path)
            .await?
            .ok_or_else(|| FailoverError::Missing(profile_id.to_string()))?;
        Ok(attrs)
    }

    async fn find_profile(&self, id: &str) -> Result<Option<Profile>, FailoverError> {
        match self.find_connection_path(id).await {
            Ok(path) => Ok(self.settings_map_to_profile(id, &path).await?.map(|(p, _)| p)),
            Err(FailoverError::Missing(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn find_device_for(&self, profile: &Profile) -> Result<Option<Device>, FailoverError> {
        let path = self.find_connection_path(&profile.id).await?;
        let raw = connection::get_settings(&self.conn, &path).await?;
        let pinned_iface = raw
            .get("connection")
            .and_then(|c| c.get("interface-name"))
            .and_then(|v| v.0.as_str())
            .map(|s| s.to_string());

        let device_paths = networkmanager::get_devices(&self.conn).await?;
        for device_path in device_paths {
            if let Some(iface) = &pinned_iface {
                let candidate_iface = device::interface(&self.conn, &device_path).await?;
                if &candidate_iface == iface {
                    return Ok(Some(self.device_for_path(&device_path).await?));
                }
            } else {
                let device_type: DeviceType = device::device_type(&self.conn, &device_path).await?.into();
                let wanted: ConnectionKind = device_type.into();
                if wanted == profile.kind {
                    return Ok(Some(self.device_for_path(&device_path).await?));
                }
            }
        }
        Ok(None)
    }

    async fn active_connections(&self) -> Result<HashMap<String, ActiveConnection>, FailoverError> {
        let paths = networkmanager::active_connections(&self.conn).await?;
        let mut result = HashMap::with_capacity(paths.len());
        for path in paths {
            let connection_path = active_connection::connection(&self.conn, &path).await?;
            let raw = connection::get_settings(&self.conn, &connection_path).await?;
            let id = raw
                .get("connection")
                .and_then(|c| c.get("id"))
                .and_then(|v| v.0.as_str())
                .map(|s| s.to_string());
            let id = match id {
                Some(id) => id,
                None => continue,
            };
            let state: ActiveConnectionState = active_connection::state(&self.conn, &path).await?.into();
            let device_paths = active_connection::devices(&self.conn, &path).await?;
            let mut interfaces = Vec::with_capacity(device_paths.len());
            for dp in device_paths {
                interfaces.push(device::interface(&self.conn, &dp).await?);
            }
            result.insert(
                id.clone(),
                ActiveConnection {
                    profile_id: id,
                    state,
                    interfaces,
                },
            );
        }
        Ok(result)
    }

    async fn activate(&self, profile: &Profile, device: &Device) -> Result<ActiveConnection, FailoverError> {
        let connection_path = self.find_connection_path(&profile.id).await?;
        let device_path = self.find_device_path(&device.interface_name).await?;
        let active_path = networkmanager::activate_connection(&self.conn, &connection_path, &device_path).await?;
        let state: ActiveConnectionState = active_connection::state(&self.conn, &active_path).await?.into();
        Ok(ActiveConnection {
            profile_id: profile.id.clone(),
            state,
            interfaces: vec![device.interface_name.clone()],
        })
    }

    async fn deactivate(&self, active: &ActiveConnection) -> Result<(), FailoverError> {
        let active_paths = networkmanager::active_connections(&self.conn).await?;
        for path in active_paths {
            let connection_path = active_connection::connection(&self.conn, &path).await?;
            let raw = connection::get_settings(&self.conn, &connection_path).await?;
            let matches = raw
                .get("connection")
                .and_then(|c| c.get("id"))
                .and_then(|v| v.0.as_str())
                == Some(active.profile_id.as_str());
            if matches {
                networkmanager::deactivate_connection(&self.conn, &path).await?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// NetworkManager owns route metrics for everything but the cellular
    /// pseudo-interfaces, through each connection's own `ipv4.route-metric`
    /// setting. Pushing an updated value live (without tearing the device
    /// down) means patching that setting and reapplying it to the device
    /// that's currently carrying the connection.
    async fn set_device_metric(&self, device: &Device, metric: u32) -> Result<(), FailoverError> {
        let device_path = self.find_device_path(&device.interface_name).await?;
        let active_path = device::active_connection(&self.conn, &device_path).await?;
        if &*active_path == "/" {
            return Err(FailoverError::Missing(format!("{} has no active connection", device.interface_name)));
        }
        let connection_path = active_connection::connection(&self.conn, &active_path).await?;
        let mut settings = connection::get_settings(&self.conn, &connection_path).await?;
        settings
            .entry("ipv4".to_string())
            .or_insert_with(HashMap::new)
            .insert("route-metric".to_string(), Variant(Box::new(metric as i64) as Box<dyn RefArg>));
        device::reapply(&self.conn, &device_path, settings, 0, 0).await
    }

    async fn set_interface_metric(&self, interface_name: &str, metric: u32) -> Result<(), FailoverError> {
        let status = Command::new(&self.ifmetric_bin)
            .arg(interface_name)
            .arg(metric.to_string())
            .status()
            .map_err(|e| FailoverError::Transport(format!("ifmetric {}: {}", interface_name, e)))?;
        if !status.success() {
            return Err(FailoverError::Transport(format!(
                "ifmetric {} {} exited with {}",
                interface_name, metric, status
            )));
        }
        Ok(())
    }
}

impl NetworkManagerClient {
    async fn find_connection_path(&self, profile_id: &str) -> Result<DbusPath<'static>, FailoverError> {
        let paths = settings::list_connections(&self.conn).await?;
        for path in paths {
            let raw = connection::get_settings(&self.conn, &path).await?;
            let id = raw
                .get("connection")
                .and_then(|c| c.get("id"))
                .and_then(|v| v.0.as_str());
            if id == Some(profile_id) {
                return Ok(path);
            }
        }
        Err(FailoverError::Missing(profile_id.to_string()))
    }

    async fn find_device_path(&self, interface_name: &str) -> Result<DbusPath<'static>, FailoverError> {
        let device_paths = networkmanager::get_devices(&self.conn).await?;
        for device_path in device_paths {
            if device::interface(&self.conn, &device_path).await? == interface_name {
                return Ok(device_path);
            }
        }
        Err(FailoverError::Missing(interface_name.to_string()))
    }
}
