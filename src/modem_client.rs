//! Capability abstraction over the modem-management daemon, grounded on
//! `modem_manager.py`'s `ModemManager.set_primary_sim_slot` idempotency
//! check: a SIM-slot switch is only ever issued when the modem isn't
//! already on the requested slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dbus::nonblock::SyncConnection;
use dbus::Path as DbusPath;

use crate::dbus_iface::modem;
use crate::errors::FailoverError;

#[async_trait]
pub trait ModemClient: Send + Sync {
    async fn primary_sim_slot(&self, udi: &str) -> Result<i32, FailoverError>;

    /// Idempotent: if `slot` is already primary, returns `Ok(true)` without
    /// issuing a D-Bus call.
    async fn set_primary_sim_slot(&self, udi: &str, slot: i32) -> Result<bool, FailoverError>;
}

pub struct ModemManagerClient {
    conn: Arc<SyncConnection>,
}

impl ModemManagerClient {
    pub fn new(conn: Arc<SyncConnection>) -> Self {
        ModemManagerClient { conn }
    }
}

#[async_trait]
impl ModemClient for ModemManagerClient {
    async fn primary_sim_slot(&self, udi: &str) -> Result<i32, FailoverError> {
        let path = DbusPath::from(udi.to_string());
        let slot = modem::primary_sim_slot(&self.conn, &path).await?;
        Ok(slot as i32)
    }

    async fn set_primary_sim_slot(&self, udi: &str, slot: i32) -> Result<bool, FailoverError> {
        let path = DbusPath::from(udi.to_string());
        let current = modem::primary_sim_slot(&self.conn, &path).await?;
        if current as i32 == slot {
            return Ok(true);
        }
        modem::set_primary_sim_slot(&self.conn, &path, slot as u32).await?;
        Ok(true)
    }
}

/// In-memory fake used by Engine unit tests.
#[derive(Default)]
pub struct FakeModemClient {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    primary_slot: HashMap<String, i32>,
}

impl FakeModemClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_primary(&self, udi: &str, slot: i32) {
        self.state.lock().unwrap().primary_slot.insert(udi.to_string(), slot);
    }
}

#[async_trait]
impl ModemClient for FakeModemClient {
    async fn primary_sim_slot(&self, udi: &str) -> Result<i32, FailoverError> {
        Ok(*self.state.lock().unwrap().primary_slot.get(udi).unwrap_or(&1))
    }

    async fn set_primary_sim_slot(&self, udi: &str, slot: i32) -> Result<bool, FailoverError> {
        let mut state = self.state.lock().unwrap();
        let current = *state.primary_slot.get(udi).unwrap_or(&1);
        if current == slot {
            return Ok(true);
        }
        state.primary_slot.insert(udi.to_string(), slot);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_primary_is_idempotent() {
        let client = FakeModemClient::new();
        client.set_primary("/modem/0", 2);
        assert!(client.set_primary_sim_slot("/modem/0", 2).await.unwrap());
        assert_eq!(client.primary_sim_slot("/modem/0").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn set_primary_switches_when_different() {
        let client = FakeModemClient::new();
        client.set_primary("/modem/0", 2);
        assert!(client.set_primary_sim_slot("/modem/0", 1).await.unwrap());
        assert_eq!(client.primary_sim_slot("/modem/0").await.unwrap(), 1);
    }
}
