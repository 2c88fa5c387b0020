//! Peer-to-peer connection options.

use serde::{Deserialize, Serialize};

/// Transport used to reach a TURN relay.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayKind {
    /// TURN over UDP.
    #[default]
    TurnUdp,
    /// TURN over TCP.
    TurnTcp,
    /// TURN over TLS.
    TurnTls,
}

/// A relay the peer connection may fall back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    /// Relay endpoint as `host:port`.
    pub address: String,
    /// Relay credentials.
    pub username: String,
    /// Relay credentials.
    pub password: String,
    /// Relay transport.
    pub kind: RelayKind,
}

/// Options for [`Session::setup_peer_connection`](crate::session::Session::setup_peer_connection).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerOptions {
    /// STUN server used for address discovery, as `host:port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stun_server: Option<String>,
    /// Relays tried when a direct path cannot be established.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relays: Vec<Relay>,
}

impl PeerOptions {
    /// Options with no STUN server and no relays.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the STUN server.
    #[must_use]
    pub fn with_stun_server(mut self, address: impl Into<String>) -> Self {
        self.stun_server = Some(address.into());
        self
    }

    /// Append a relay.
    #[must_use]
    pub fn with_relay(mut self, relay: Relay) -> Self {
        self.relays.push(relay);
        self
    }
}
