//! Data model shared by the NetClient/ModemClient capability traits and the
//! Engine: profiles, devices, active connections, and the enums mirroring
//! NetworkManager's own D-Bus state codes.

use serde::{Deserialize, Serialize};

/// Sentinel `sim_slot` value meaning "don't switch, use whatever is primary".
pub const SIM_SLOT_DEFAULT: i32 = -1;

/// A persistent network-connection definition, as NetworkManager knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: String,
    pub kind: ConnectionKind,
    /// Only meaningful for `ConnectionKind::Modem`. `SIM_SLOT_DEFAULT` means
    /// "do not switch slots for this profile".
    pub sim_slot: i32,
}

impl Profile {
    /// True for link types the sticky anti-flap discipline applies to
    /// (cellular and Wi-Fi client connections flap more than wired links).
    pub fn is_sticky(&self) -> bool {
        matches!(self.kind, ConnectionKind::Modem | ConnectionKind::Wifi)
    }

    pub fn is_cellular(&self) -> bool {
        matches!(self.kind, ConnectionKind::Modem)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Ethernet,
    Wifi,
    Modem,
    Other,
}

/// A host interface a profile binds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub interface_name: String,
    pub managed: bool,
    /// Opaque device path, stable across reboots but not across a modem SIM
    /// slot switch (ModemManager recreates the device object).
    pub udi: String,
    pub active_profile_id: Option<String>,
}

/// An in-progress or established activation of a `Profile`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveConnection {
    pub profile_id: String,
    pub state: ActiveConnectionState,
    pub interfaces: Vec<String>,
}

impl ActiveConnection {
    /// The interface the prober should check. A connection can bind
    /// multiple interfaces (bridges, bonds); the first one is enough to
    /// probe reachability.
    pub fn primary_interface(&self) -> Option<&str> {
        self.interfaces.first().map(String::as_str)
    }
}

/// Mirrors `NMActiveConnectionState` (`org.freedesktop.NetworkManager.Connection.Active`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveConnectionState {
    Unknown,
    Activating,
    Activated,
    Deactivating,
    Deactivated,
}

impl From<u32> for ActiveConnectionState {
    fn from(state: u32) -> Self {
        match state {
            1 => ActiveConnectionState::Activating,
            2 => ActiveConnectionState::Activated,
            3 => ActiveConnectionState::Deactivating,
            4 => ActiveConnectionState::Deactivated,
            _ => ActiveConnectionState::Unknown,
        }
    }
}

/// Mirrors `NMDeviceType` for the subset of device types this daemon cares
/// about (`org.freedesktop.NetworkManager.Device`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Ethernet,
    Wifi,
    Modem,
    Other,
}

impl From<u32> for DeviceType {
    fn from(value: u32) -> Self {
        match value {
            1 => DeviceType::Ethernet,
            2 => DeviceType::Wifi,
            8 => DeviceType::Modem,
            _ => DeviceType::Other,
        }
    }
}

impl From<DeviceType> for ConnectionKind {
    fn from(value: DeviceType) -> Self {
        match value {
            DeviceType::Ethernet => ConnectionKind::Ethernet,
            DeviceType::Wifi => ConnectionKind::Wifi,
            DeviceType::Modem => ConnectionKind::Modem,
            DeviceType::Other => ConnectionKind::Other,
        }
    }
}

/// Named priority bucket. Iterated high → medium → low by the Engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierName {
    High,
    Medium,
    Low,
}

impl TierName {
    pub fn priority(self) -> u8 {
        match self {
            TierName::High => 3,
            TierName::Medium => 2,
            TierName::Low => 1,
        }
    }

    /// `100 * (4 - priority) + 5`: high=105, medium=205, low=305.
    pub fn base_route_metric(self) -> u32 {
        100 * (4 - self.priority() as u32) + 5
    }

    pub const ALL: [TierName; 3] = [TierName::High, TierName::Medium, TierName::Low];
}

/// Route metric assigned to the currently-selected profile. Strictly smaller
/// than any tier's `base_route_metric`, so the selected uplink always wins
/// the kernel's route lookup over every other tier.
pub const CURRENT_ROUTE_METRIC: u32 = 55;

/// Priority bucket populated with the profile IDs it manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    pub name: TierName,
    pub connections: Vec<String>,
}

impl Tier {
    pub fn priority(&self) -> u8 {
        self.name.priority()
    }

    pub fn base_route_metric(&self) -> u32 {
        self.name.base_route_metric()
    }
}
