//! Capability abstraction over the network-management daemon. Any daemon
//! satisfying `NetClient` is acceptable to the Engine; the D-Bus-backed
//! implementation lives in [`networkmanager`], and an in-memory fake for
//! unit tests lives in [`fake`].

pub mod fake;
pub mod networkmanager;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::errors::FailoverError;
use crate::model::{ActiveConnection, Device, Profile};

/// Extra profile attributes the Engine doesn't model directly but that
/// [`crate::config`]'s auto-tier derivation consults.
#[derive(Debug, Clone, Default)]
pub struct ProfileAttributes {
    pub autoconnect: bool,
    pub never_default: bool,
    pub wifi_ap_mode: bool,
}

#[async_trait]
pub trait NetClient: Send + Sync {
    async fn list_profiles(&self) -> Result<Vec<Profile>, FailoverError>;

    async fn profile_attributes(&self, profile_id: &str) -> Result<ProfileAttributes, FailoverError>;

    async fn find_profile(&self, id: &str) -> Result<Option<Profile>, FailoverError>;

    /// Resolves the device a profile would bind to: by interface name if the
    /// profile pins one, else by matching device type.
    async fn find_device_for(&self, profile: &Profile) -> Result<Option<Device>, FailoverError>;

    async fn active_connections(&self) -> Result<HashMap<String, ActiveConnection>, FailoverError>;

    async fn activate(&self, profile: &Profile, device: &Device) -> Result<ActiveConnection, FailoverError>;

    async fn deactivate(&self, active: &ActiveConnection) -> Result<(), FailoverError>;

    async fn set_device_metric(&self, device: &Device, metric: u32) -> Result<(), FailoverError>;

    /// For modem pseudo-interfaces (ppp/wwan) that the daemon will not
    /// re-rank itself.
    async fn set_interface_metric(&self, interface_name: &str, metric: u32) -> Result<(), FailoverError>;
}
