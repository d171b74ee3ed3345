// Peer records and their state machine.
//
// A peer is created on first observation (seed list, gossiped peer URLs, or
// an inbound connection) and only leaves the registry on `forget`. The node
// drives transitions; this module owns the data and the bookkeeping rules.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use url::Url;
use uuid::Uuid;

use crate::config::Limits;
use crate::net::connection::Connection;
use crate::net::protocol::GossipError;
use crate::util::Throttle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerState {
    /// Known but never contacted (or reset for another attempt).
    New,
    Connecting { since: Instant },
    Connected,
    Querying { since: Instant },
    Queried,
    /// Declared itself broadcast-only; do not query it.
    Passive,
    /// Never contact again (ourselves, wrong genesis, or asked to be
    /// forgotten).
    Ignored { reason: String },
    Failed { reason: String, at: Instant },
}

impl PeerState {
    pub fn name(&self) -> &'static str {
        match self {
            PeerState::New => "new",
            PeerState::Connecting { .. } => "connecting",
            PeerState::Connected => "connected",
            PeerState::Querying { .. } => "querying",
            PeerState::Queried => "queried",
            PeerState::Passive => "passive",
            PeerState::Ignored { .. } => "ignored",
            PeerState::Failed { .. } => "failed",
        }
    }
}

pub struct Peer {
    pub uuid: Uuid,
    /// Connectable gossip address; None for inbound-only peers (port 0).
    url: Mutex<Option<Url>>,
    state: Mutex<PeerState>,
    connection: Mutex<Option<Arc<Connection>>>,
    last_seen: Mutex<Option<Instant>>,
    round_trip: Mutex<Option<Duration>>,
    throttle: Mutex<Throttle>,
}

impl Peer {
    pub fn new(uuid: Uuid, url: Option<Url>, limits: &Limits) -> Arc<Peer> {
        Arc::new(Peer {
            uuid,
            url: Mutex::new(url),
            state: Mutex::new(PeerState::New),
            connection: Mutex::new(None),
            last_seen: Mutex::new(None),
            round_trip: Mutex::new(None),
            throttle: Mutex::new(Throttle::new(
                limits.throttle_interval,
                limits.throttle_backlog,
            )),
        })
    }

    fn guard<'a, T>(m: &'a Mutex<T>) -> MutexGuard<'a, T> {
        m.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> PeerState {
        Self::guard(&self.state).clone()
    }

    pub fn set_state(&self, state: PeerState) {
        *Self::guard(&self.state) = state;
    }

    pub fn url(&self) -> Option<Url> {
        Self::guard(&self.url).clone()
    }

    pub fn set_url(&self, url: Option<Url>) {
        *Self::guard(&self.url) = url;
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        Self::guard(&self.connection).clone()
    }

    pub fn set_connection(&self, connection: Option<Arc<Connection>>) {
        *Self::guard(&self.connection) = connection;
    }

    pub fn touch(&self) {
        *Self::guard(&self.last_seen) = Some(Instant::now());
    }

    pub fn last_seen(&self) -> Option<Instant> {
        *Self::guard(&self.last_seen)
    }

    pub fn seen_within(&self, window: Duration) -> bool {
        self.last_seen().map(|t| t.elapsed() <= window).unwrap_or(false)
    }

    pub fn record_round_trip(&self, rtt: Duration) {
        *Self::guard(&self.round_trip) = Some(rtt);
    }

    pub fn round_trip(&self) -> Option<Duration> {
        *Self::guard(&self.round_trip)
    }

    /// Rate limiting for this peer's incoming requests.
    pub fn admit_request(&self) -> Option<Duration> {
        Self::guard(&self.throttle).admit(Instant::now())
    }

    pub fn mark_failed(&self, reason: impl Into<String>) {
        self.set_connection(None);
        self.set_state(PeerState::Failed {
            reason: reason.into(),
            at: Instant::now(),
        });
    }

    pub fn mark_ignored(&self, reason: impl Into<String>) {
        self.set_connection(None);
        self.set_state(PeerState::Ignored {
            reason: reason.into(),
        });
    }

    /// The connection if the peer is in a state where traffic makes sense.
    pub fn live_connection(&self) -> Result<Arc<Connection>, GossipError> {
        match self.state() {
            PeerState::Ignored { .. } => Err(GossipError::NotConnected),
            _ => self.connection().ok_or(GossipError::NotConnected),
        }
    }

    /// Should this peer be advertised to others right now?
    pub fn advertisable(&self, window: Duration) -> bool {
        matches!(self.state(), PeerState::Queried)
            && self.seen_within(window)
            && self.url().is_some()
    }
}

/// Build the canonical gossip URL for a peer: `ws://host:port/?uuid=…`.
pub fn peer_url(host: &str, port: u16, uuid: &Uuid) -> Option<Url> {
    if port == 0 {
        return None;
    }
    Url::parse(&format!("ws://{host}:{port}/?uuid={uuid}")).ok()
}

/// Parse an advertised peer URL, extracting the UUID it claims.
pub fn parse_peer_url(s: &str) -> Result<(Url, Uuid), GossipError> {
    let url = Url::parse(s).map_err(|_| GossipError::Malformed)?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(GossipError::Malformed);
    }
    if url.host_str().is_none() || url.port_or_known_default().is_none() {
        return Err(GossipError::Malformed);
    }
    let uuid = url
        .query_pairs()
        .find(|(k, _)| k == "uuid")
        .and_then(|(_, v)| Uuid::parse_str(&v).ok())
        .ok_or(GossipError::Malformed)?;
    Ok((url, uuid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_url_roundtrip() {
        let uuid = Uuid::new_v4();
        let url = peer_url("192.0.2.7", 8338, &uuid).unwrap();
        let (parsed, parsed_uuid) = parse_peer_url(url.as_str()).unwrap();
        assert_eq!(parsed_uuid, uuid);
        assert_eq!(parsed.host_str(), Some("192.0.2.7"));
        assert_eq!(parsed.port(), Some(8338));
    }

    #[test]
    fn test_inbound_only_peer_has_no_url() {
        assert!(peer_url("192.0.2.7", 0, &Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_parse_rejects_junk() {
        assert!(parse_peer_url("ftp://192.0.2.7:8338/?uuid=x").is_err());
        assert!(parse_peer_url("ws://192.0.2.7:8338/").is_err());
        assert!(parse_peer_url("not a url").is_err());
    }

    #[test]
    fn test_state_machine_bookkeeping() {
        let limits = Limits::default();
        let peer = Peer::new(Uuid::new_v4(), None, &limits);
        assert_eq!(peer.state(), PeerState::New);
        assert!(!peer.advertisable(Duration::from_secs(3600)));

        peer.set_state(PeerState::Queried);
        peer.touch();
        // Advertisable requires a connectable URL too.
        assert!(!peer.advertisable(Duration::from_secs(3600)));
        peer.set_url(peer_url("192.0.2.1", 8338, &peer.uuid));
        assert!(peer.advertisable(Duration::from_secs(3600)));

        peer.mark_ignored("test");
        assert!(matches!(peer.state(), PeerState::Ignored { .. }));
        assert!(peer.live_connection().is_err());
    }
}
