//! Hand-written D-Bus proxy bindings for NetworkManager and ModemManager.
//!
//! A `dbus-codegen-rust` dump of the full introspection XML isn't checked
//! in; instead this module is written directly against the handful of
//! methods and properties this crate actually calls — one trait per D-Bus
//! interface, each method a thin `self.method_call(...)` wrapper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dbus::arg::{RefArg, Variant};
use dbus::nonblock::{self, Proxy, SyncConnection};
use dbus::Path;

use crate::errors::FailoverError;

pub const NM_BUSNAME: &str = "org.freedesktop.NetworkManager";
pub const NM_PATH: &str = "/org/freedesktop/NetworkManager";
pub const NM_SETTINGS_PATH: &str = "/org/freedesktop/NetworkManager/Settings";

pub const MM_BUSNAME: &str = "org.freedesktop.ModemManager1";
pub const MM_PATH: &str = "/org/freedesktop/ModemManager1";

/// Per-call D-Bus timeout. The activation protocol layers its own 30s
/// wait-for-state loop on top of many short calls at this timeout, rather
/// than one long-lived blocking call that could hang the whole daemon.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub type VariantMap = HashMap<String, Variant<Box<dyn RefArg>>>;
pub type SettingsMap = HashMap<String, VariantMap>;

fn proxy<'a>(conn: &'a Arc<SyncConnection>, destination: &'static str, path: Path<'static>) -> Proxy<'a, &'a Arc<SyncConnection>> {
    nonblock::Proxy::new(destination, path, CALL_TIMEOUT, conn)
}

/// `org.freedesktop.NetworkManager`
pub mod networkmanager {
    use super::*;

    pub async fn get_devices(conn: &Arc<SyncConnection>) -> Result<Vec<Path<'static>>, FailoverError> {
        let p = proxy(conn, NM_BUSNAME, NM_PATH.into());
        let (devices,): (Vec<Path<'static>>,) = p
            .method_call("org.freedesktop.NetworkManager", "GetDevices", ())
            .await?;
        Ok(devices)
    }

    pub async fn activate_connection(
        conn: &Arc<SyncConnection>,
        connection: &Path<'static>,
        device: &Path<'static>,
    ) -> Result<Path<'static>, FailoverError> {
        let p = proxy(conn, NM_BUSNAME, NM_PATH.into());
        let specific_object = Path::from("/");
        let (active,): (Path<'static>,) = p
            .method_call(
                "org.freedesktop.NetworkManager",
                "ActivateConnection",
                (connection.clone(), device.clone(), specific_object),
            )
            .await?;
        Ok(active)
    }

    pub async fn deactivate_connection(
        conn: &Arc<SyncConnection>,
        active: &Path<'static>,
    ) -> Result<(), FailoverError> {
        let p = proxy(conn, NM_BUSNAME, NM_PATH.into());
        p.method_call::<(), _, _, _>(
            "org.freedesktop.NetworkManager",
            "DeactivateConnection",
            (active.clone(),),
        )
        .await?;
        Ok(())
    }

    pub async fn active_connections(conn: &Arc<SyncConnection>) -> Result<Vec<Path<'static>>, FailoverError> {
        let p = proxy(conn, NM_BUSNAME, NM_PATH.into());
        let paths: Vec<Path<'static>> = p
            .get("org.freedesktop.NetworkManager", "ActiveConnections")
            .await?;
        Ok(paths)
    }
}

/// `org.freedesktop.NetworkManager.Settings`
pub mod settings {
    use super::*;

    pub async fn list_connections(conn: &Arc<SyncConnection>) -> Result<Vec<Path<'static>>, FailoverError> {
        let p = proxy(conn, NM_BUSNAME, NM_SETTINGS_PATH.into());
        let (connections,): (Vec<Path<'static>>,) = p
            .method_call("org.freedesktop.NetworkManager.Settings", "ListConnections", ())
            .await?;
        Ok(connections)
    }
}

/// `org.freedesktop.NetworkManager.Settings.Connection`
pub mod connection {
    use super::*;

    pub async fn get_settings(
        conn: &Arc<SyncConnection>,
        connection_path: &Path<'static>,
    ) -> Result<SettingsMap, FailoverError> {
        let p = proxy(conn, NM_BUSNAME, connection_path.clone());
        let (settings,): (SettingsMap,) = p
            .method_call("org.freedesktop.NetworkManager.Settings.Connection", "GetSettings", ())
            .await?;
        Ok(settings)
    }
}

/// `org.freedesktop.NetworkManager.Device`
pub mod device {
    use super::*;

    pub async fn interface(conn: &Arc<SyncConnection>, device_path: &Path<'static>) -> Result<String, FailoverError> {
        let p = proxy(conn, NM_BUSNAME, device_path.clone());
        let iface: String = p.get("org.freedesktop.NetworkManager.Device", "Interface").await?;
        Ok(iface)
    }

    pub async fn device_type(conn: &Arc<SyncConnection>, device_path: &Path<'static>) -> Result<u32, FailoverError> {
        let p = proxy(conn, NM_BUSNAME, device_path.clone());
        let t: u32 = p.get("org.freedesktop.NetworkManager.Device", "DeviceType").await?;
        Ok(t)
    }

    pub async fn managed(conn: &Arc<SyncConnection>, device_path: &Path<'static>) -> Result<bool, FailoverError> {
        let p = proxy(conn, NM_BUSNAME, device_path.clone());
        let m: bool = p.get("org.freedesktop.NetworkManager.Device", "Managed").await?;
        Ok(m)
    }

    pub async fn udi(conn: &Arc<SyncConnection>, device_path: &Path<'static>) -> Result<String, FailoverError> {
        let p = proxy(conn, NM_BUSNAME, device_path.clone());
        let u: String = p.get("org.freedesktop.NetworkManager.Device", "Udi").await?;
        Ok(u)
    }

    pub async fn active_connection(conn: &Arc<SyncConnection>, device_path: &Path<'static>) -> Result<Path<'static>, FailoverError> {
        let p = proxy(conn, NM_BUSNAME, device_path.clone());
        let ac: Path<'static> = p.get("org.freedesktop.NetworkManager.Device", "ActiveConnection").await?;
        Ok(ac)
    }

    /// Applies an updated connection-settings map to an already-active
    /// device without tearing it down, the way NetworkManager's own clients
    /// push a changed `ipv4.route-metric` live.
    pub async fn reapply(
        conn: &Arc<SyncConnection>,
        device_path: &Path<'static>,
        settings: SettingsMap,
        version_id: u64,
        flags: u32,
    ) -> Result<(), FailoverError> {
        let p = proxy(conn, NM_BUSNAME, device_path.clone());
        p.method_call::<(), _, _, _>(
            "org.freedesktop.NetworkManager.Device",
            "Reapply",
            (settings, version_id, flags),
        )
        .await?;
        Ok(())
    }
}

/// `org.freedesktop.NetworkManager.Connection.Active`
pub mod active_connection {
    use super::*;

    pub async fn state(conn: &Arc<SyncConnection>, active_path: &Path<'static>) -> Result<u32, FailoverError> {
        let p = proxy(conn, NM_BUSNAME, active_path.clone());
        let s: u32 = p
            .get("org.freedesktop.NetworkManager.Connection.Active", "State")
            .await?;
        Ok(s)
    }

    pub async fn connection(conn: &Arc<SyncConnection>, active_path: &Path<'static>) -> Result<Path<'static>, FailoverError> {
        let p = proxy(conn, NM_BUSNAME, active_path.clone());
        let c: Path<'static> = p
            .get("org.freedesktop.NetworkManager.Connection.Active", "Connection")
            .await?;
        Ok(c)
    }

    pub async fn devices(conn: &Arc<SyncConnection>, active_path: &Path<'static>) -> Result<Vec<Path<'static>>, FailoverError> {
        let p = proxy(conn, NM_BUSNAME, active_path.clone());
        let d: Vec<Path<'static>> = p
            .get("org.freedesktop.NetworkManager.Connection.Active", "Devices")
            .await?;
        Ok(d)
    }
}

/// `org.freedesktop.ModemManager1.Modem` (properties reachable via the
/// standard `org.freedesktop.DBus.Properties` interface, same as every
/// other proxy here; ModemManager doesn't expose `PrimarySimSlot` as a
/// plain method).
pub mod modem {
    use super::*;

    pub async fn primary_sim_slot(conn: &Arc<SyncConnection>, modem_path: &Path<'static>) -> Result<u32, FailoverError> {
        let p = proxy(conn, MM_BUSNAME, modem_path.clone());
        let slot: u32 = p.get("org.freedesktop.ModemManager1.Modem", "PrimarySimSlot").await?;
        Ok(slot)
    }

    pub async fn set_primary_sim_slot(
        conn: &Arc<SyncConnection>,
        modem_path: &Path<'static>,
        slot: u32,
    ) -> Result<(), FailoverError> {
        let p = proxy(conn, MM_BUSNAME, modem_path.clone());
        p.method_call::<(), _, _, _>(
            "org.freedesktop.ModemManager1.Modem",
            "SetPrimarySimSlot",
            (slot,),
        )
        .await?;
        Ok(())
    }
}
