// Node orchestrator: owns the peer registry, the tick timer, the fetcher
// worker, and the rebroadcast policy. One read task per connection; anything
// heavier than frame decoding is dispatched off it so the socket keeps
// draining. No lock is held across network I/O.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use futures_util::stream::SplitStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::consensus::app::Application;
use crate::consensus::ledger::Ledger;
use crate::crypto::hash::BlockHash;
use crate::miner::miner::Miner;
use crate::net::connection::{
    Connection, HandshakeInfo, WsStream, accept_inbound, client_url, connect_outbound,
};
use crate::net::fetcher::{Candidate, Fetcher};
use crate::net::peer::{Peer, PeerState, parse_peer_url, peer_url};
use crate::net::protocol::{
    ACCEPTER_FIRST_COUNTER, BlockBody, Gossip, GossipError, INITIATOR_FIRST_COUNTER, IndexBody,
    decode_frame,
};
use crate::primitives::block::{Block, unix_now};
use crate::primitives::transaction::Transaction;

/// Bound on waiting for a peer's reply to one request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Node<A: Application> {
    pub uuid: Uuid,
    config: NodeConfig,
    ledger: Arc<Ledger<A>>,
    miner: Arc<Miner<A>>,
    peers: Mutex<HashMap<Uuid, Arc<Peer>>>,
    tick_queue: Mutex<VecDeque<Uuid>>,
    fetcher: Fetcher,
    fetch_rx: Mutex<Option<mpsc::UnboundedReceiver<(Candidate, u32)>>>,
    /// URLs observed to be ourselves; consulted to discard self-advertisements.
    own_urls: Mutex<HashSet<String>>,
    /// Per-peer clock offsets in seconds, from query/index round trips.
    offsets: Mutex<HashMap<Uuid, i64>>,
}

impl<A: Application> Node<A> {
    pub fn new(config: NodeConfig, ledger: Arc<Ledger<A>>, miner: Arc<Miner<A>>) -> Arc<Node<A>> {
        let (fetcher, fetch_rx) = Fetcher::new();
        Arc::new(Node {
            uuid: Uuid::new_v4(),
            config,
            ledger,
            miner,
            peers: Mutex::new(HashMap::new()),
            tick_queue: Mutex::new(VecDeque::new()),
            fetcher,
            fetch_rx: Mutex::new(Some(fetch_rx)),
            own_urls: Mutex::new(HashSet::new()),
            offsets: Mutex::new(HashMap::new()),
        })
    }

    fn guard<'a, T>(m: &'a Mutex<T>) -> MutexGuard<'a, T> {
        m.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ledger(&self) -> &Arc<Ledger<A>> {
        &self.ledger
    }

    pub fn miner(&self) -> &Arc<Miner<A>> {
        &self.miner
    }

    pub fn peer_count(&self) -> usize {
        Self::guard(&self.peers).len()
    }

    pub fn peer(&self, uuid: &Uuid) -> Option<Arc<Peer>> {
        Self::guard(&self.peers).get(uuid).cloned()
    }

    /// Spawn the accept loop, the tick timer, the fetch worker, and the
    /// mined-block pump. Returns once everything is running.
    pub async fn start(
        self: &Arc<Self>,
        mut mined_rx: mpsc::UnboundedReceiver<Block<A::Payload>>,
    ) -> Result<(), GossipError> {
        if self.config.port > 0 {
            let bind = format!("{}:{}", self.config.bind_address, self.config.port);
            let listener = TcpListener::bind(&bind)
                .await
                .map_err(|e| GossipError::Transport(e.to_string()))?;
            info!(%bind, uuid = %self.uuid, "gossip listener up");
            let node = self.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, remote)) => {
                            let node = node.clone();
                            tokio::spawn(async move {
                                node.handle_inbound(stream, remote.ip().to_string()).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
            });
        }

        // Tick timer: advance a few peers per beat, round-robin.
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.limits.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                node.tick();
            }
        });

        // Fetch worker: one outstanding fetch at a time.
        let node = self.clone();
        let mut fetch_rx = Self::guard(&self.fetch_rx)
            .take()
            .ok_or(GossipError::NotConnected)?;
        tokio::spawn(async move {
            while let Some((candidate, hops)) = fetch_rx.recv().await {
                node.run_fetch(candidate, hops).await;
            }
        });

        // Mined blocks enter through the same path as gossiped ones.
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(block) = mined_rx.recv().await {
                node.receive_block(block, None, false).await;
            }
        });

        Ok(())
    }

    /// Merge a peer URL into the registry; self-advertisements are
    /// discarded, never stored.
    pub fn add_peer_url(&self, s: &str) -> Option<Arc<Peer>> {
        let (url, uuid) = match parse_peer_url(s) {
            Ok(parsed) => parsed,
            Err(_) => {
                debug!(url = s, "discarding unparseable peer URL");
                return None;
            }
        };
        if uuid == self.uuid || Self::guard(&self.own_urls).contains(url.as_str()) {
            return None;
        }
        Some(self.ensure_peer(uuid, Some(url)))
    }

    fn ensure_peer(&self, uuid: Uuid, url: Option<Url>) -> Arc<Peer> {
        let mut peers = Self::guard(&self.peers);
        if let Some(existing) = peers.get(&uuid) {
            if existing.url().is_none() && url.is_some() {
                existing.set_url(url);
            }
            return existing.clone();
        }
        let peer = Peer::new(uuid, url, &self.config.limits);
        peers.insert(uuid, peer.clone());
        peer
    }

    // ---- tick ----

    fn tick(self: &Arc<Self>) {
        let batch: Vec<Arc<Peer>> = {
            let peers = Self::guard(&self.peers);
            let mut queue = Self::guard(&self.tick_queue);
            if queue.is_empty() {
                queue.extend(peers.keys().copied());
            }
            let mut batch = Vec::new();
            while batch.len() < self.config.limits.peers_per_tick {
                let Some(uuid) = queue.pop_front() else {
                    break;
                };
                if let Some(peer) = peers.get(&uuid) {
                    batch.push(peer.clone());
                }
            }
            batch
        };
        for peer in batch {
            self.advance(peer);
        }
    }

    /// Drive one peer a single step through its state machine.
    fn advance(self: &Arc<Self>, peer: Arc<Peer>) {
        let retry = self.config.limits.peer_retry_interval;
        match peer.state() {
            PeerState::New => {
                if peer.url().is_some() {
                    let node = self.clone();
                    tokio::spawn(async move { node.connect_peer(peer).await });
                }
            }
            PeerState::Connecting { since } | PeerState::Querying { since } => {
                // Hung handshakes and queries reset for another round.
                if since.elapsed() > retry {
                    debug!(peer = %peer.uuid, state = peer.state().name(), "resetting hung peer");
                    peer.set_connection(None);
                    peer.set_state(PeerState::New);
                }
            }
            PeerState::Connected | PeerState::Queried => {
                let node = self.clone();
                tokio::spawn(async move { node.query_peer(peer).await });
            }
            PeerState::Failed { at, .. } => {
                if at.elapsed() > retry {
                    peer.set_state(PeerState::New);
                }
            }
            PeerState::Passive | PeerState::Ignored { .. } => {}
        }
    }

    // ---- connections ----

    async fn connect_peer(self: Arc<Self>, peer: Arc<Peer>) {
        let Some(target) = peer.url() else {
            return;
        };
        peer.set_state(PeerState::Connecting {
            since: Instant::now(),
        });
        let dial = client_url(&target, &self.uuid, self.config.port);
        match timeout(REQUEST_TIMEOUT, connect_outbound(&dial)).await {
            Ok(Ok(ws)) => {
                let (sink, read_half) = ws.split();
                let connection = Arc::new(Connection::new(
                    sink,
                    INITIATOR_FIRST_COUNTER,
                    self.config.limits.max_outstanding_requests,
                ));
                peer.set_connection(Some(connection.clone()));
                peer.set_state(PeerState::Connected);
                debug!(peer = %peer.uuid, url = %target, "outbound connection open");
                self.spawn_read_loop(peer.clone(), connection, read_half);
                self.query_peer(peer).await;
            }
            Ok(Err(e)) => peer.mark_failed(e.to_string()),
            Err(_) => peer.mark_failed("connect timed out"),
        }
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, remote_host: String) {
        let (ws, info) = match accept_inbound(stream).await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(host = %remote_host, error = %e, "inbound handshake refused");
                return;
            }
        };
        let HandshakeInfo { uuid, port } = info;
        let advertised = peer_url(&remote_host, port, &uuid);

        if uuid == self.uuid {
            // Self-loop: remember the URL so advertisements of it are
            // discarded, but never register ourselves as a peer.
            info!(host = %remote_host, "rejecting connection from ourselves");
            if let Some(url) = advertised {
                Self::guard(&self.own_urls).insert(url.to_string());
            }
            return;
        }

        let peer = self.ensure_peer(uuid, advertised);
        if peer.connection().is_some()
            && peer.seen_within(self.config.limits.peer_replace_interval)
        {
            debug!(peer = %uuid, "dropping duplicate inbound; existing connection is fresh");
            return;
        }
        if let PeerState::Ignored { reason } = peer.state() {
            debug!(peer = %uuid, reason = %reason, "refusing inbound from ignored peer");
            return;
        }

        let (sink, read_half) = ws.split();
        let connection = Arc::new(Connection::new(
            sink,
            ACCEPTER_FIRST_COUNTER,
            self.config.limits.max_outstanding_requests,
        ));
        peer.set_connection(Some(connection.clone()));
        peer.set_state(PeerState::Connected);
        peer.touch();
        debug!(peer = %uuid, host = %remote_host, "inbound connection open");
        self.spawn_read_loop(peer, connection, read_half);
    }

    fn spawn_read_loop(
        self: &Arc<Self>,
        peer: Arc<Peer>,
        connection: Arc<Connection>,
        mut read_half: SplitStream<WsStream>,
    ) {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(message) = read_half.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!(peer = %peer.uuid, "non-UTF-8 frame; closing");
                            break;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(peer = %peer.uuid, error = %e, "read failed");
                        break;
                    }
                };
                let (counter, gossip) = match decode_frame(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        // Corrupted frames poison the connection, not the node.
                        warn!(peer = %peer.uuid, error = %e, "bad frame; closing connection");
                        break;
                    }
                };
                // A reply finds its waiting request; anything else is a
                // request or broadcast for us.
                let Some(request) = connection.resolve(counter, gossip) else {
                    continue;
                };
                let Some(delay) = peer.admit_request() else {
                    continue; // over the rate limit: dropped silently
                };
                let node = node.clone();
                let peer = peer.clone();
                let connection = connection.clone();
                tokio::spawn(async move {
                    if delay > Duration::ZERO {
                        tokio::time::sleep(delay).await;
                    }
                    node.handle_request(peer, connection, counter, request).await;
                });
            }
            peer.set_connection(None);
            if !matches!(peer.state(), PeerState::Ignored { .. }) {
                peer.set_state(PeerState::New);
            }
        });
    }

    // ---- request handling ----

    async fn handle_request(
        self: Arc<Self>,
        peer: Arc<Peer>,
        connection: Arc<Connection>,
        counter: u64,
        request: Gossip,
    ) {
        let reply = match request {
            Gossip::Query => {
                peer.touch();
                if self.config.passive {
                    Some(Gossip::Passive)
                } else {
                    Some(Gossip::Index(self.index_body()))
                }
            }
            Gossip::Fetch { hash } => Some(match self.ledger.get(&hash) {
                Some(block) => match BlockBody::from_block(&block) {
                    Ok(body) => Gossip::Block(body),
                    Err(e) => Gossip::Error {
                        message: e.to_string(),
                    },
                },
                None => Gossip::Error {
                    message: GossipError::BlockNotFound.to_string(),
                },
            }),
            Gossip::Block(body) => {
                match body.to_block::<A::Payload>() {
                    Ok(block) => {
                        self.receive_block(block, Some(peer.uuid), false).await;
                        None
                    }
                    Err(e) => Some(Gossip::Error {
                        message: e.to_string(),
                    }),
                }
            }
            Gossip::Transaction(tx) => {
                self.receive_transaction(tx, Some(peer.uuid)).await;
                None
            }
            Gossip::Passive => {
                peer.set_state(PeerState::Passive);
                None
            }
            Gossip::Forget => {
                info!(peer = %peer.uuid, "peer asked to be forgotten");
                peer.mark_ignored("peer requested");
                Self::guard(&self.peers).remove(&peer.uuid);
                connection.close().await;
                None
            }
            // Stray replies with no matching request.
            Gossip::Index(_) | Gossip::Error { .. } => None,
        };
        if let Some(reply) = reply
            && let Err(e) = connection.reply(counter, &reply).await
        {
            debug!(peer = %peer.uuid, error = %e, "reply failed");
        }
    }

    // ---- outbound query ----

    async fn query_peer(self: Arc<Self>, peer: Arc<Peer>) {
        let connection = match peer.live_connection() {
            Ok(connection) => connection,
            Err(_) => {
                peer.set_state(PeerState::New);
                return;
            }
        };
        peer.set_state(PeerState::Querying {
            since: Instant::now(),
        });
        let started = Instant::now();
        let local_send = unix_now();
        match timeout(REQUEST_TIMEOUT, connection.request(&Gossip::Query)).await {
            Ok(Ok(Gossip::Index(index))) => {
                let local_recv = unix_now();
                peer.record_round_trip(started.elapsed());
                // Offset of the peer's clock against the round-trip midpoint.
                let midpoint = (local_send + local_recv) / 2;
                self.record_offset(peer.uuid, index.time as i64 - midpoint as i64);
                self.process_index(&peer, index);
            }
            Ok(Ok(Gossip::Passive)) => peer.set_state(PeerState::Passive),
            Ok(Ok(Gossip::Error { message })) => peer.mark_failed(message),
            Ok(Ok(_)) => peer.mark_failed("unexpected reply to query"),
            Ok(Err(e)) => peer.mark_failed(e.to_string()),
            Err(_) => {
                // Still `querying`; the tick loop resets it if it stays hung.
            }
        }
    }

    fn process_index(self: &Arc<Self>, peer: &Arc<Peer>, index: IndexBody) {
        let our_genesis = self
            .ledger
            .genesis()
            .signature
            .map(|s| s.to_hex())
            .unwrap_or_default();
        if index.genesis != our_genesis {
            peer.mark_ignored("different genesis");
            return;
        }
        peer.set_state(PeerState::Queried);
        peer.touch();

        for advertised in &index.peers {
            self.add_peer_url(advertised);
        }

        let Ok(highest) = BlockHash::from_hex(&index.highest) else {
            peer.mark_failed("unparseable head hash in index");
            return;
        };
        let head = self.ledger.highest();
        if index.height > head.index && self.ledger.get(&highest).is_none() {
            debug!(peer = %peer.uuid, height = index.height, "peer advertises a longer chain");
            self.fetcher.add(
                Candidate {
                    hash: highest,
                    height: index.height,
                    peer: peer.uuid,
                },
                0,
            );
        }
    }

    // ---- fetching ----

    async fn run_fetch(self: &Arc<Self>, candidate: Candidate, hops: u32) {
        let Some(peer) = self.peer(&candidate.peer) else {
            return;
        };
        let Ok(connection) = peer.live_connection() else {
            self.fetcher.forget(&candidate);
            return;
        };
        let request = Gossip::Fetch {
            hash: candidate.hash,
        };
        match timeout(REQUEST_TIMEOUT, connection.request(&request)).await {
            Ok(Ok(Gossip::Block(body))) => match body.to_block::<A::Payload>() {
                Ok(block)
                    if block.signature == Some(candidate.hash)
                        && block.index == candidate.height =>
                {
                    self.receive_block(block.clone(), Some(peer.uuid), true).await;
                    // Still orphaned: walk one ancestor further, within budget.
                    if self.ledger.has_orphan(&candidate.hash)
                        && hops < self.config.limits.max_extra_blocks
                    {
                        let (height, hash) = self.ledger.earliest_root(&block);
                        self.fetcher.add(
                            Candidate {
                                hash,
                                height,
                                peer: peer.uuid,
                            },
                            hops + 1,
                        );
                    }
                }
                Ok(_) => {
                    // Answered with a block we did not ask for.
                    peer.mark_failed("fetch returned a different block");
                    self.fetcher.forget(&candidate);
                }
                Err(e) => {
                    peer.mark_failed(e.to_string());
                    self.fetcher.forget(&candidate);
                }
            },
            Ok(Ok(Gossip::Error { message })) => {
                debug!(peer = %peer.uuid, message = %message, "fetch refused");
                self.fetcher.forget(&candidate);
            }
            Ok(Ok(_)) => {
                peer.mark_failed("unexpected reply to fetch");
                self.fetcher.forget(&candidate);
            }
            Ok(Err(e)) => {
                debug!(peer = %peer.uuid, error = %e, "fetch failed");
                self.fetcher.forget(&candidate);
            }
            Err(_) => {
                debug!(peer = %peer.uuid, "fetch timed out");
                self.fetcher.forget(&candidate);
            }
        }
    }

    // ---- block & transaction intake ----

    /// Every new block funnels through here: gossip, fetch results, and our
    /// own miner. Returns whether the chain head changed.
    pub async fn receive_block(
        self: &Arc<Self>,
        block: Block<A::Payload>,
        from: Option<Uuid>,
        solicited: bool,
    ) -> bool {
        if !block.is_genesis()
            && block.timestamp
                > self.median_network_time() + self.config.limits.future_threshold.as_secs()
        {
            debug!(
                index = block.index,
                timestamp = block.timestamp,
                "discarding block from the far future"
            );
            return false;
        }

        let was_new = self.ledger.is_new(&block);
        let body = BlockBody::from_block(&block).ok();
        let changed = match self.ledger.receive(block.clone()) {
            Ok(changed) => changed,
            Err(e) => {
                debug!(index = block.index, error = %e, "block refused");
                return false;
            }
        };

        if changed {
            self.miner.head_changed();
        } else if was_new
            && !solicited
            && let Some(signature) = block.signature
            && self.ledger.has_orphan(&signature)
            && let Some(peer_uuid) = from
        {
            // Fetched orphans walk their gap inside `run_fetch`, under the
            // extra-blocks budget; an unsolicited orphan starts one here,
            // aimed at the peer that sent it.
            let (height, hash) = self.ledger.earliest_root(&block);
            self.fetcher.add(
                Candidate {
                    hash,
                    height,
                    peer: peer_uuid,
                },
                0,
            );
        }

        if was_new && !solicited && let Some(body) = body {
            self.rebroadcast_block(body, from).await;
        }
        changed
    }

    pub async fn receive_transaction(self: &Arc<Self>, tx: Transaction, from: Option<Uuid>) {
        if !tx.is_signature_valid() {
            // Invalid gossiped signatures are ignored silently.
            debug!("ignoring transaction with invalid signature");
            return;
        }
        let was_known = self.miner.knows(&tx);
        if let Err(e) = self.miner.append(tx.clone()) {
            debug!(error = %e, "transaction not minable");
            return;
        }
        // Accepted (template or aside) and new here: forward once.
        if !was_known && self.miner.knows(&tx) {
            self.rebroadcast_transaction(tx, from).await;
        }
    }

    // ---- rebroadcast ----

    fn broadcast_targets(&self, except: Option<Uuid>, include_connected: bool) -> Vec<Arc<Connection>> {
        let peers = Self::guard(&self.peers);
        peers
            .values()
            .filter(|p| Some(p.uuid) != except)
            .filter(|p| match p.state() {
                PeerState::Queried | PeerState::Passive => true,
                PeerState::Connected => include_connected,
                _ => false,
            })
            .filter_map(|p| p.connection())
            .collect()
    }

    async fn rebroadcast_block(self: &Arc<Self>, body: BlockBody, except: Option<Uuid>) {
        for connection in self.broadcast_targets(except, true) {
            let gossip = Gossip::Block(body.clone());
            tokio::spawn(async move {
                let _ = connection.notify(&gossip).await;
            });
        }
    }

    async fn rebroadcast_transaction(self: &Arc<Self>, tx: Transaction, except: Option<Uuid>) {
        for connection in self.broadcast_targets(except, false) {
            let gossip = Gossip::Transaction(tx.clone());
            tokio::spawn(async move {
                let _ = connection.notify(&gossip).await;
            });
        }
    }

    // ---- time ----

    fn record_offset(&self, peer: Uuid, offset: i64) {
        Self::guard(&self.offsets).insert(peer, offset);
    }

    /// Local clock corrected by the median of per-peer offsets.
    pub fn median_network_time(&self) -> u64 {
        let offsets = Self::guard(&self.offsets);
        if offsets.is_empty() {
            return unix_now();
        }
        let mut sorted: Vec<i64> = offsets.values().copied().collect();
        sorted.sort_unstable();
        let n = sorted.len();
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2
        };
        (unix_now() as i64 + median).max(0) as u64
    }

    // ---- index ----

    fn index_body(&self) -> IndexBody {
        let genesis = self.ledger.genesis();
        let head = self.ledger.highest();
        let window = self.config.limits.advertisement_age;
        let peers: Vec<String> = {
            let registry = Self::guard(&self.peers);
            registry
                .values()
                .filter(|p| p.advertisable(window))
                .filter_map(|p| p.url().map(|u| u.to_string()))
                .collect()
        };
        IndexBody {
            genesis: genesis.signature.map(|s| s.to_hex()).unwrap_or_default(),
            highest: head.signature.map(|s| s.to_hex()).unwrap_or_default(),
            height: head.index,
            time: unix_now(),
            peers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::consensus::app::CounterApplication;
    use crate::consensus::chain::MemoryChain;
    use crate::primitives::payload::TransactionPayload;

    fn mock_node() -> Arc<Node<CounterApplication>> {
        let genesis = Block::<TransactionPayload>::genesis(b"node test", 4);
        let chain = MemoryChain::with_difficulty(genesis, 4).unwrap();
        let ledger = Arc::new(Ledger::new(
            chain,
            Arc::new(CounterApplication::new()),
            Limits::default(),
        ));
        let (mined_tx, _mined_rx) = mpsc::unbounded_channel();
        let miner = Miner::new(ledger.clone(), BlockHash::of(b"node miner"), mined_tx);
        miner.set_enabled(false);
        Node::new(NodeConfig::default(), ledger, miner)
    }

    #[test]
    fn test_self_advertisement_never_registered() {
        let node = mock_node();
        let own = peer_url("127.0.0.1", 8338, &node.uuid).unwrap();
        assert!(node.add_peer_url(own.as_str()).is_none());
        assert_eq!(node.peer_count(), 0);
    }

    #[test]
    fn test_peer_registration_dedups_by_uuid() {
        let node = mock_node();
        let uuid = Uuid::new_v4();
        let a = peer_url("192.0.2.1", 8338, &uuid).unwrap();
        let b = peer_url("192.0.2.1", 8338, &uuid).unwrap();
        node.add_peer_url(a.as_str()).unwrap();
        node.add_peer_url(b.as_str()).unwrap();
        assert_eq!(node.peer_count(), 1);
    }

    #[test]
    fn test_median_network_time_uses_offset_median() {
        let node = mock_node();
        node.record_offset(Uuid::new_v4(), -1000);
        node.record_offset(Uuid::new_v4(), 40);
        node.record_offset(Uuid::new_v4(), 5000);
        let now = unix_now();
        let median = node.median_network_time();
        // Median offset is +40 seconds.
        assert!(median >= now + 39 && median <= now + 41);
    }

    #[test]
    fn test_index_only_advertises_fresh_queried_peers() {
        let node = mock_node();
        let uuid = Uuid::new_v4();
        let url = peer_url("192.0.2.9", 8338, &uuid).unwrap();
        let peer = node.add_peer_url(url.as_str()).unwrap();

        assert!(node.index_body().peers.is_empty());
        peer.set_state(PeerState::Queried);
        peer.touch();
        assert_eq!(node.index_body().peers, vec![url.to_string()]);
    }

    #[tokio::test]
    async fn test_far_future_block_discarded_before_ledger() {
        let node = mock_node();
        let genesis = node.ledger().genesis();
        let mut block = Block::<TransactionPayload>::template(&BlockHash::of(b"m"));
        block.previous = genesis.signature.unwrap();
        block.index = 1;
        block.timestamp = unix_now() + 3 * 3600;
        block.mine(4);

        assert!(!node.receive_block(block, None, false).await);
        assert_eq!(node.ledger().orphan_count(), 0);
        assert_eq!(node.ledger().highest().index, 0);
    }
}
