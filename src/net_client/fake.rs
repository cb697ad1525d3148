//! In-memory `NetClient` used by Engine tests. Lets a test script every
//! profile/device/active-connection directly and optionally fail specific
//! calls, without a real D-Bus daemon.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{NetClient, ProfileAttributes};
use crate::errors::FailoverError;
use crate::model::{ActiveConnection, ActiveConnectionState, Device, Profile};

/// Cheaply `Clone`-able: tests keep one handle to drive the fake and box
/// another (identical, state-sharing) handle for the `Engine` under test.
#[derive(Default, Clone)]
pub struct FakeNetClient {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    profiles: HashMap<String, Profile>,
    attributes: HashMap<String, ProfileAttributes>,
    devices: HashMap<String, Device>,
    active: HashMap<String, ActiveConnection>,
    metrics: HashMap<String, u32>,
    fail_activate: std::collections::HashSet<String>,
    stuck_activating: std::collections::HashSet<String>,
    fail_transport: bool,
}

impl FakeNetClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_profile(&self, profile: Profile, attrs: ProfileAttributes, device: Device) {
        let mut inner = self.inner.lock().unwrap();
        inner.attributes.insert(profile.id.clone(), attrs);
        inner.devices.insert(profile.id.clone(), device);
        inner.profiles.insert(profile.id.clone(), profile);
    }

    pub fn set_active(&self, active: ActiveConnection) {
        self.inner.lock().unwrap().active.insert(active.profile_id.clone(), active);
    }

    pub fn clear_active(&self, profile_id: &str) {
        self.inner.lock().unwrap().active.remove(profile_id);
    }

    pub fn fail_activation_of(&self, profile_id: &str) {
        self.inner.lock().unwrap().fail_activate.insert(profile_id.to_string());
    }

    /// Makes `activate` report `Activating` forever instead of immediately
    /// reaching `Activated`, so `wait_for_state`'s 30s budget actually
    /// elapses — used to test the stuck-activating timeout path.
    pub fn stuck_activating(&self, profile_id: &str) {
        self.inner.lock().unwrap().stuck_activating.insert(profile_id.to_string());
    }

    /// Removes a profile's device binding so `find_device_for` reports
    /// "not found" — used to simulate a modem that never reappears after a
    /// SIM-slot switch.
    pub fn remove_device(&self, profile_id: &str) {
        self.inner.lock().unwrap().devices.remove(profile_id);
    }

    pub fn set_transport_failing(&self, failing: bool) {
        self.inner.lock().unwrap().fail_transport = failing;
    }

    pub fn metric_for(&self, key: &str) -> Option<u32> {
        self.inner.lock().unwrap().metrics.get(key).copied()
    }
}

#[async_trait]
impl NetClient for FakeNetClient {
    async fn list_profiles(&self) -> Result<Vec<Profile>, FailoverError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_transport {
            return Err(FailoverError::Transport("fake transport down".into()));
        }
        Ok(inner.profiles.values().cloned().collect())
    }

    async fn profile_attributes(&self, profile_id: &str) -> Result<ProfileAttributes, FailoverError> {
        let inner = self.inner.lock().unwrap();
        inner
            .attributes
            .get(profile_id)
            .cloned()
            .ok_or_else(|| FailoverError::Missing(profile_id.to_string()))
    }

    async fn find_profile(&self, id: &str) -> Result<Option<Profile>, FailoverError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_transport {
            return Err(FailoverError::Transport("fake transport down".into()));
        }
        Ok(inner.profiles.get(id).cloned())
    }

    async fn find_device_for(&self, profile: &Profile) -> Result<Option<Device>, FailoverError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_transport {
            return Err(FailoverError::Transport("fake transport down".into()));
        }
        Ok(inner.devices.get(&profile.id).cloned())
    }

    async fn active_connections(&self) -> Result<HashMap<String, ActiveConnection>, FailoverError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_transport {
            return Err(FailoverError::Transport("fake transport down".into()));
        }
        Ok(inner.active.clone())
    }

    async fn activate(&self, profile: &Profile, device: &Device) -> Result<ActiveConnection, FailoverError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_transport {
            return Err(FailoverError::Transport("fake transport down".into()));
        }
        if inner.fail_activate.contains(&profile.id) {
            return Err(FailoverError::Timeout(format!("activation of {} timed out", profile.id)));
        }
        let state = if inner.stuck_activating.contains(&profile.id) {
            ActiveConnectionState::Activating
        } else {
            ActiveConnectionState::Activated
        };
        let active = ActiveConnection {
            profile_id: profile.id.clone(),
            state,
            interfaces: vec![device.interface_name.clone()],
        };
        inner.active.insert(profile.id.clone(), active.clone());
        Ok(active)
    }

    async fn deactivate(&self, active: &ActiveConnection) -> Result<(), FailoverError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_transport {
            return Err(FailoverError::Transport("fake transport down".into()));
        }
        inner.active.remove(&active.profile_id);
        Ok(())
    }

    async fn set_device_metric(&self, device: &Device, metric: u32) -> Result<(), FailoverError> {
        let mut inner = self.inner.lock().unwrap();
        inner.metrics.insert(device.interface_name.clone(), metric);
        Ok(())
    }

    async fn set_interface_metric(&self, interface_name: &str, metric: u32) -> Result<(), FailoverError> {
        let mut inner = self.inner.lock().unwrap();
        inner.metrics.insert(interface_name.to_string(), metric);
        Ok(())
    }
}
