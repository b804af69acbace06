//! Per-contact presence state machine. Host-driven: events in, actions out.
//! The host owns the timers and the network; the tracker only decides.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::codec::AddressMessage;

/// Ping interval while online when the local identity sorts first.
pub const ONLINE_PING_INTERVAL_FIRST: Duration = Duration::from_secs(60);
/// Ping interval while online when the contact identity sorts first.
pub const ONLINE_PING_INTERVAL_SECOND: Duration = Duration::from_secs(120);
pub const OFFLINE_RETRY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unknown,
    Offline,
    Online,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub state: PeerState,
    /// Interval of the repeating ping, once one is scheduled.
    pub ping_interval: Option<Duration>,
}

impl PeerInfo {
    fn unknown() -> Self {
        Self {
            address: None,
            port: None,
            state: PeerState::Unknown,
            ping_interval: None,
        }
    }
}

/// What the host must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceAction {
    /// Send a ping to the contact's advertised address and report the result.
    Ping {
        identity: String,
        address: String,
        port: u16,
    },
    /// (Re)start the contact's repeating ping timer.
    Schedule { identity: String, interval: Duration },
    /// Stop the contact's ping timer.
    Cancel { identity: String },
}

pub struct PresenceTracker {
    local_identity: String,
    peers: HashMap<String, PeerInfo>,
}

impl PresenceTracker {
    pub fn new(local_identity: impl Into<String>) -> Self {
        Self {
            local_identity: local_identity.into(),
            peers: HashMap::new(),
        }
    }

    pub fn peer(&self, identity: &str) -> Option<&PeerInfo> {
        self.peers.get(identity)
    }

    pub fn contacts(&self) -> Vec<String> {
        let mut c: Vec<String> = self.peers.keys().cloned().collect();
        c.sort();
        c
    }

    pub fn add_contact(&mut self, identity: &str) {
        self.peers
            .entry(identity.to_string())
            .or_insert_with(PeerInfo::unknown);
    }

    pub fn remove_contact(&mut self, identity: &str) -> Vec<PresenceAction> {
        match self.peers.remove(identity) {
            Some(_) => vec![PresenceAction::Cancel {
                identity: identity.to_string(),
            }],
            None => Vec::new(),
        }
    }

    /// Online interval, staggered so both sides do not ping at once.
    pub fn online_interval(&self, contact: &str) -> Duration {
        if self.local_identity.as_str() < contact {
            ONLINE_PING_INTERVAL_FIRST
        } else {
            ONLINE_PING_INTERVAL_SECOND
        }
    }

    /// A contact advertised its address. `direct` is true when it arrived peer to peer.
    /// Identities never added as contacts, and messages without a port, are ignored.
    pub fn on_address_message(
        &mut self,
        identity: &str,
        message: &AddressMessage,
        direct: bool,
    ) -> Vec<PresenceAction> {
        if message.port == 0 {
            debug!(contact = identity, "address message without a port");
            return Vec::new();
        }
        let Some(peer) = self.peers.get_mut(identity) else {
            debug!(contact = identity, "address message from unknown identity");
            return Vec::new();
        };
        let same_address =
            peer.address.as_deref() == Some(message.address.as_str()) && peer.port == Some(message.port);
        if direct && same_address && peer.state == PeerState::Online {
            debug!(contact = identity, "direct message from online contact");
            return Vec::new();
        }
        peer.address = Some(message.address.clone());
        peer.port = Some(message.port);
        if peer.state == PeerState::Unknown || peer.state == PeerState::Online {
            peer.state = PeerState::Offline;
        }
        debug!(contact = identity, address = %message.address, port = message.port, "probing contact");
        vec![PresenceAction::Ping {
            identity: identity.to_string(),
            address: message.address.clone(),
            port: message.port,
        }]
    }

    /// Result of a ping or direct send to the contact.
    pub fn on_ping_result(&mut self, identity: &str, reachable: bool) -> Vec<PresenceAction> {
        let target = if reachable {
            PeerState::Online
        } else {
            PeerState::Offline
        };
        self.set_state(identity, target)
    }

    fn set_state(&mut self, identity: &str, state: PeerState) -> Vec<PresenceAction> {
        let interval = match state {
            PeerState::Online => self.online_interval(identity),
            _ => OFFLINE_RETRY_INTERVAL,
        };
        let Some(peer) = self.peers.get_mut(identity) else {
            return Vec::new();
        };
        let changed = peer.state != state;
        if changed {
            info!(contact = identity, ?state, "presence changed");
        }
        peer.state = state;
        if !changed && peer.ping_interval == Some(interval) {
            return Vec::new();
        }
        peer.ping_interval = Some(interval);
        vec![PresenceAction::Schedule {
            identity: identity.to_string(),
            interval,
        }]
    }

    /// Timer fired: ping the contact if an address is known.
    pub fn ping_due(&self, identity: &str) -> Option<PresenceAction> {
        let peer = self.peers.get(identity)?;
        Some(PresenceAction::Ping {
            identity: identity.to_string(),
            address: peer.address.clone()?,
            port: peer.port?,
        })
    }

    /// Direct coordinates for an online contact.
    pub fn direct_target(&self, identity: &str) -> Option<(String, u16)> {
        let peer = self.peers.get(identity)?;
        if peer.state != PeerState::Online {
            return None;
        }
        Some((peer.address.clone()?, peer.port?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> AddressMessage {
        AddressMessage {
            address: "http://192.168.1.7".into(),
            port,
            is_ping: false,
        }
    }

    fn online(tracker: &mut PresenceTracker, contact: &str, port: u16) {
        tracker.add_contact(contact);
        tracker.on_address_message(contact, &addr(port), true);
        tracker.on_ping_result(contact, true);
        assert_eq!(tracker.peer(contact).unwrap().state, PeerState::Online);
    }

    #[test]
    fn new_contact_is_pinged_and_offline() {
        let mut t = PresenceTracker::new("05aa");
        t.add_contact("05bb");
        let actions = t.on_address_message("05bb", &addr(1), true);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], PresenceAction::Ping { port: 1, .. }));
        assert_eq!(t.peer("05bb").unwrap().state, PeerState::Offline);
        assert!(t.direct_target("05bb").is_none());
    }

    #[test]
    fn matching_direct_message_while_online_sends_nothing() {
        let mut t = PresenceTracker::new("05aa");
        online(&mut t, "05bb", 1);
        assert!(t.on_address_message("05bb", &addr(1), true).is_empty());
        assert_eq!(t.peer("05bb").unwrap().state, PeerState::Online);
    }

    #[test]
    fn address_change_while_online_pings_once() {
        let mut t = PresenceTracker::new("05aa");
        online(&mut t, "05bb", 1);
        let actions = t.on_address_message("05bb", &addr(2), true);
        let pings = actions
            .iter()
            .filter(|a| matches!(a, PresenceAction::Ping { .. }))
            .count();
        assert_eq!(pings, 1);
        assert_eq!(t.peer("05bb").unwrap().state, PeerState::Offline);
    }

    #[test]
    fn swarm_delivered_address_pings() {
        let mut t = PresenceTracker::new("05aa");
        online(&mut t, "05bb", 1);
        assert_eq!(t.on_address_message("05bb", &addr(1), false).len(), 1);
    }

    #[test]
    fn staggered_online_interval() {
        let mut t = PresenceTracker::new("05bb");
        t.add_contact("05cc");
        t.add_contact("05aa");
        t.on_address_message("05cc", &addr(1), true);
        assert_eq!(
            t.on_ping_result("05cc", true),
            vec![PresenceAction::Schedule {
                identity: "05cc".into(),
                interval: ONLINE_PING_INTERVAL_FIRST
            }]
        );
        t.on_address_message("05aa", &addr(1), true);
        assert_eq!(
            t.on_ping_result("05aa", true),
            vec![PresenceAction::Schedule {
                identity: "05aa".into(),
                interval: ONLINE_PING_INTERVAL_SECOND
            }]
        );
    }

    #[test]
    fn offline_reschedules_shorter_and_once() {
        let mut t = PresenceTracker::new("05aa");
        online(&mut t, "05bb", 1);
        assert_eq!(
            t.on_ping_result("05bb", false),
            vec![PresenceAction::Schedule {
                identity: "05bb".into(),
                interval: OFFLINE_RETRY_INTERVAL
            }]
        );
        assert!(t.on_ping_result("05bb", false).is_empty());
    }

    #[test]
    fn strangers_are_not_tracked() {
        let mut t = PresenceTracker::new("05aa");
        assert!(t.on_address_message("05ff", &addr(1), true).is_empty());
        assert!(t.peer("05ff").is_none());
        assert!(t.contacts().is_empty());
    }

    #[test]
    fn zero_port_is_ignored() {
        let mut t = PresenceTracker::new("05aa");
        t.add_contact("05bb");
        assert!(t.on_address_message("05bb", &addr(0), false).is_empty());
        let peer = t.peer("05bb").unwrap();
        assert_eq!(peer.state, PeerState::Unknown);
        assert_eq!(peer.port, None);
    }

    #[test]
    fn remove_cancels_timer() {
        let mut t = PresenceTracker::new("05aa");
        t.add_contact("05bb");
        assert!(t.ping_due("05bb").is_none());
        assert_eq!(t.remove_contact("05bb").len(), 1);
        assert!(t.remove_contact("05bb").is_empty());
        assert!(t.on_ping_result("05bb", true).is_empty());
    }
}
