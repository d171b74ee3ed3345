// One gossip connection: a WebSocket carrying [counter, body] frames.
//
// The write half lives behind an async lock; request/reply correlation is a
// counter map feeding oneshot channels. The subprotocol token is checked on
// both ends of the handshake, and the initiator's URL query must carry its
// node UUID and inbound port (0 when it accepts none).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, header};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, accept_hdr_async_with_config, connect_async_with_config,
};
use url::Url;
use uuid::Uuid;

use crate::config::PROTOCOL_VERSION;
use crate::net::protocol::{Gossip, GossipError, encode_frame};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// A block payload tops out at 1 MiB; anything much larger on the wire is a
// memory-exhaustion attempt, not gossip.
const MAX_FRAME: usize = 2 * 1024 * 1024;

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_FRAME);
    config.max_frame_size = Some(MAX_FRAME);
    config
}

/// What an inbound peer declared about itself during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub uuid: Uuid,
    /// The peer's own inbound gossip port; 0 when it accepts no inbound.
    pub port: u16,
}

pub struct Connection {
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    next_counter: AtomicU64,
    outstanding: Mutex<HashMap<u64, oneshot::Sender<Gossip>>>,
    max_outstanding: usize,
}

impl Connection {
    pub fn new(
        sink: SplitSink<WsStream, Message>,
        first_counter: u64,
        max_outstanding: usize,
    ) -> Connection {
        Connection {
            sink: tokio::sync::Mutex::new(sink),
            next_counter: AtomicU64::new(first_counter),
            outstanding: Mutex::new(HashMap::new()),
            max_outstanding,
        }
    }

    async fn send_frame(&self, counter: u64, gossip: &Gossip) -> Result<(), GossipError> {
        let text = encode_frame(counter, gossip)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Send a reply on the counter of the request it answers.
    pub async fn reply(&self, counter: u64, gossip: &Gossip) -> Result<(), GossipError> {
        self.send_frame(counter, gossip).await
    }

    /// Send without expecting an answer (broadcast traffic).
    pub async fn notify(&self, gossip: &Gossip) -> Result<(), GossipError> {
        let counter = self.next_counter.fetch_add(2, Ordering::SeqCst);
        self.send_frame(counter, gossip).await
    }

    /// Send a request and wait for the correlated reply. The caller bounds
    /// the wait with a timeout.
    pub async fn request(&self, gossip: &Gossip) -> Result<Gossip, GossipError> {
        let counter = self.next_counter.fetch_add(2, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
            if outstanding.len() >= self.max_outstanding {
                // Evict the stalest correlation; its requester sees the
                // connection as gone.
                if let Some(&oldest) = outstanding.keys().min() {
                    outstanding.remove(&oldest);
                }
            }
            outstanding.insert(counter, tx);
        }
        if let Err(e) = self.send_frame(counter, gossip).await {
            self.outstanding
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&counter);
            return Err(e);
        }
        rx.await.map_err(|_| GossipError::NotConnected)
    }

    /// Route an incoming frame to the request waiting on its counter. A
    /// frame nobody waits for comes back: it is a request for us to handle.
    pub fn resolve(&self, counter: u64, gossip: Gossip) -> Option<Gossip> {
        let sender = {
            let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
            outstanding.remove(&counter)
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(gossip);
                None
            }
            None => Some(gossip),
        }
    }

    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
    }
}

/// The URL an initiator dials: the target address plus our own identity.
pub fn client_url(target: &Url, own_uuid: &Uuid, own_port: u16) -> Url {
    let mut dial = target.clone();
    dial.set_query(Some(&format!("uuid={own_uuid}&port={own_port}")));
    dial
}

/// Open an outbound gossip connection, negotiating the protocol token.
pub async fn connect_outbound(dial: &Url) -> Result<WsStream, GossipError> {
    let mut request = dial
        .as_str()
        .into_client_request()
        .map_err(|_| GossipError::Malformed)?;
    request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(PROTOCOL_VERSION),
    );
    let (stream, response) = connect_async_with_config(request, Some(ws_config()), false).await?;
    let negotiated = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if negotiated != Some(PROTOCOL_VERSION) {
        return Err(GossipError::ProtocolVersionUnsupported);
    }
    Ok(stream)
}

/// Accept an inbound gossip connection: negotiate the protocol token and
/// read the peer's UUID and advertised port from the URL query.
pub async fn accept_inbound(stream: TcpStream) -> Result<(WsStream, HandshakeInfo), GossipError> {
    let mut info: Option<HandshakeInfo> = None;
    let callback = |request: &Request, mut response: Response| {
        let offered = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        match offered {
            None => return Err(refuse(StatusCode::BAD_REQUEST)),
            Some(list) => {
                if !list.split(',').map(str::trim).any(|p| p == PROTOCOL_VERSION) {
                    return Err(refuse(StatusCode::BAD_REQUEST));
                }
                response.headers_mut().insert(
                    header::SEC_WEBSOCKET_PROTOCOL,
                    HeaderValue::from_static(PROTOCOL_VERSION),
                );
            }
        }
        match parse_handshake_query(request.uri().query().unwrap_or("")) {
            Some(parsed) => info = Some(parsed),
            None => return Err(refuse(StatusCode::BAD_REQUEST)),
        }
        Ok(response)
    };
    let ws =
        accept_hdr_async_with_config(MaybeTlsStream::Plain(stream), callback, Some(ws_config()))
            .await?;
    let info = info.ok_or(GossipError::ProtocolVersionMissing)?;
    Ok((ws, info))
}

fn refuse(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = status;
    response
}

fn parse_handshake_query(query: &str) -> Option<HandshakeInfo> {
    let mut uuid = None;
    let mut port = 0u16;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=')?;
        match key {
            "uuid" => uuid = Uuid::parse_str(value).ok(),
            "port" => port = value.parse().ok()?,
            _ => return None,
        }
    }
    Some(HandshakeInfo { uuid: uuid?, port })
}
