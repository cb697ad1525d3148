//! The Engine's half of the external MQTT-mirror interface. No MQTT wire
//! code lives in the core: the Engine publishes immutable
//! snapshots over a `tokio::sync::watch` channel and emits an event whenever
//! it deactivates a connection of its own accord, over a `broadcast`
//! channel, so a separate mirror task (out of scope here) can tell an
//! Engine-initiated deactivation apart from an externally-caused one.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::model::{ActiveConnectionState, TierName};

/// Per-profile state the mirror publishes to MQTT topics. Fields beyond
/// what the Engine tracks itself (`operator`, `signal`, `access_tech`) are
/// always `None` here — they belong to a modem-status poller outside the
/// core's scope, and the mirror fills them in from its own sources.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileSnapshot {
    pub profile_id: String,
    pub active: bool,
    pub state: Option<ActiveConnectionState>,
    pub device: Option<String>,
    pub address: Option<String>,
    pub connectivity: Option<bool>,
}

/// Everything the mirror needs to render the current selection, taken as
/// one atomic copy at the end of a tick.
#[derive(Debug, Clone, Default)]
pub struct MirrorSnapshot {
    pub current_tier: Option<TierName>,
    pub current_profile_id: Option<String>,
    pub profiles: HashMap<String, ProfileSnapshot>,
}

/// Fired whenever the Engine deactivates a profile on its own initiative
/// (lesser-cellular cleanup, sticky/priority preemption) — as opposed to a
/// deactivation the mirror itself requested on an operator's behalf.
#[derive(Debug, Clone)]
pub struct EngineDeactivated {
    pub profile_id: String,
}

pub struct MirrorChannel {
    snapshot_tx: watch::Sender<MirrorSnapshot>,
    events_tx: broadcast::Sender<EngineDeactivated>,
}

impl MirrorChannel {
    pub fn new() -> (Self, watch::Receiver<MirrorSnapshot>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(MirrorSnapshot::default());
        let (events_tx, _) = broadcast::channel(32);
        (MirrorChannel { snapshot_tx, events_tx }, snapshot_rx)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineDeactivated> {
        self.events_tx.subscribe()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<MirrorSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn publish(&self, snapshot: MirrorSnapshot) {
        let _ = self.snapshot_tx.send(snapshot);
    }

    /// Broadcast sends are lossy by design when nobody is listening; a
    /// missing mirror task is not a core failure.
    pub fn notify_deactivated(&self, profile_id: &str) {
        let _ = self.events_tx.send(EngineDeactivated { profile_id: profile_id.to_string() });
    }
}

impl Default for MirrorChannel {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_subscriber() {
        let (channel, mut rx) = MirrorChannel::new();
        let mut snapshot = MirrorSnapshot::default();
        snapshot.current_profile_id = Some("eth-wan".into());
        channel.publish(snapshot.clone());
        assert_eq!(rx.borrow_and_update().current_profile_id, Some("eth-wan".to_string()));
    }

    #[tokio::test]
    async fn deactivation_event_is_broadcast() {
        let (channel, _rx) = MirrorChannel::new();
        let mut events = channel.subscribe_events();
        channel.notify_deactivated("sim2");
        let event = events.recv().await.unwrap();
        assert_eq!(event.profile_id, "sim2");
    }
}
