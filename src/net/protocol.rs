// Gossip wire format.
//
// Every frame is a JSON array [counter, body]; the body carries a mandatory
// "t" discriminator. Each message type gets its own schema struct and
// unknown fields are rejected, not tolerated. Counters: the connection
// initiator uses even values from 0, the accepter odd values from 1, and a
// reply echoes the counter of its request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::hash::BlockHash;
use crate::primitives::block::Block;
use crate::primitives::payload::Payload;
use crate::primitives::transaction::Transaction;

/// First request counter used by the side that opened the connection.
pub const INITIATOR_FIRST_COUNTER: u64 = 0;
/// First request counter used by the side that accepted it.
pub const ACCEPTER_FIRST_COUNTER: u64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("malformed gossip")]
    Malformed,
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("deserialization failed: {0}")]
    Deserialization(String),
    #[error("protocol version missing")]
    ProtocolVersionMissing,
    #[error("protocol version unsupported")]
    ProtocolVersionUnsupported,
    #[error("not connected")]
    NotConnected,
    #[error("block format error: {0}")]
    BlockFormat(String),
    #[error("block not found")]
    BlockNotFound,
    #[error("transport: {0}")]
    Transport(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for GossipError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        GossipError::Transport(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Gossip {
    Query,
    Index(IndexBody),
    Fetch { hash: BlockHash },
    Block(BlockBody),
    Transaction(Transaction),
    Passive,
    Forget,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexBody {
    /// Hex signature of the genesis block; chains differ, peers part ways.
    pub genesis: String,
    /// Hex signature of the head block.
    pub highest: String,
    pub height: u64,
    /// Sender's clock in unix seconds, for offset estimation.
    pub time: u64,
    /// Advertised peer URLs.
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockBody {
    pub version: u64,
    pub index: u64,
    /// Base64 of the nonce's 8 little-endian bytes.
    pub nonce: String,
    /// Hex signature of the predecessor.
    pub previous: String,
    /// Hex signature of this block.
    pub hash: String,
    /// Base64 identity hash of the sealing miner.
    pub miner: String,
    pub timestamp: u64,
    /// Base64 wire payload.
    pub payload: String,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FetchBody {
    hash: String,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct BlockEnvelope {
    block: BlockBody,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransactionEnvelope {
    tx: Transaction,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ErrorBody {
    message: String,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmptyBody {}

impl BlockBody {
    pub fn from_block<P: Payload>(block: &Block<P>) -> Result<BlockBody, GossipError> {
        let signature = block
            .signature
            .ok_or_else(|| GossipError::BlockFormat("unsigned block".into()))?;
        Ok(BlockBody {
            version: block.version,
            index: block.index,
            nonce: data_encoding::BASE64.encode(&block.nonce.to_le_bytes()),
            previous: block.previous.to_hex(),
            hash: signature.to_hex(),
            miner: block.miner.to_base64(),
            timestamp: block.timestamp,
            payload: data_encoding::BASE64.encode(&block.payload.encode()),
        })
    }

    pub fn to_block<P: Payload>(&self) -> Result<Block<P>, GossipError> {
        let nonce_bytes = data_encoding::BASE64
            .decode(self.nonce.as_bytes())
            .map_err(|_| GossipError::BlockFormat("nonce is not base64".into()))?;
        if nonce_bytes.len() != 8 {
            return Err(GossipError::BlockFormat("nonce must be 8 bytes".into()));
        }
        let nonce = u64::from_le_bytes(nonce_bytes.try_into().unwrap());

        let previous = BlockHash::from_hex(&self.previous)
            .map_err(|e| GossipError::BlockFormat(format!("previous: {e}")))?;
        let signature = BlockHash::from_hex(&self.hash)
            .map_err(|e| GossipError::BlockFormat(format!("hash: {e}")))?;

        let miner = BlockHash::from_base64(&self.miner)
            .map_err(|e| GossipError::BlockFormat(format!("miner: {e}")))?;

        let payload_bytes = data_encoding::BASE64
            .decode(self.payload.as_bytes())
            .map_err(|_| GossipError::BlockFormat("payload is not base64".into()))?;
        let payload = if self.index == 0 {
            P::genesis(&payload_bytes)
        } else {
            P::decode(&payload_bytes)
                .map_err(|e| GossipError::BlockFormat(format!("payload: {e}")))?
        };

        Ok(Block {
            version: self.version,
            index: self.index,
            nonce,
            previous,
            miner,
            timestamp: self.timestamp,
            payload,
            signature: Some(signature),
        })
    }
}

impl Gossip {
    fn action(&self) -> &'static str {
        match self {
            Gossip::Query => "query",
            Gossip::Index(_) => "index",
            Gossip::Fetch { .. } => "fetch",
            Gossip::Block(_) => "block",
            Gossip::Transaction(_) => "tx",
            Gossip::Passive => "passive",
            Gossip::Forget => "forget",
            Gossip::Error { .. } => "error",
        }
    }

    fn body_value(&self) -> Result<Value, GossipError> {
        let value = match self {
            Gossip::Query | Gossip::Passive | Gossip::Forget => {
                serde_json::to_value(EmptyBody {})
            }
            Gossip::Index(body) => serde_json::to_value(body),
            Gossip::Fetch { hash } => serde_json::to_value(FetchBody {
                hash: hash.to_hex(),
            }),
            Gossip::Block(body) => serde_json::to_value(BlockEnvelope {
                block: body.clone(),
            }),
            Gossip::Transaction(tx) => serde_json::to_value(TransactionEnvelope {
                tx: tx.clone(),
            }),
            Gossip::Error { message } => serde_json::to_value(ErrorBody {
                message: message.clone(),
            }),
        };
        value.map_err(|e| GossipError::Deserialization(e.to_string()))
    }
}

pub fn encode_frame(counter: u64, gossip: &Gossip) -> Result<String, GossipError> {
    let mut body = gossip.body_value()?;
    let object = body.as_object_mut().ok_or(GossipError::Malformed)?;
    object.insert("t".into(), Value::String(gossip.action().into()));
    serde_json::to_string(&Value::Array(vec![Value::from(counter), body]))
        .map_err(|e| GossipError::Deserialization(e.to_string()))
}

pub fn decode_frame(text: &str) -> Result<(u64, Gossip), GossipError> {
    let value: Value = serde_json::from_str(text).map_err(|_| GossipError::Malformed)?;
    let Value::Array(parts) = value else {
        return Err(GossipError::Malformed);
    };
    let [counter_value, body] = parts.as_slice() else {
        return Err(GossipError::Malformed);
    };
    let counter = counter_value.as_u64().ok_or(GossipError::Malformed)?;

    let mut body = body.clone();
    let object = body.as_object_mut().ok_or(GossipError::Malformed)?;
    let Some(Value::String(action)) = object.remove("t") else {
        return Err(GossipError::Malformed);
    };

    let deser = |e: serde_json::Error| GossipError::Deserialization(e.to_string());
    let gossip = match action.as_str() {
        "query" => {
            serde_json::from_value::<EmptyBody>(body).map_err(deser)?;
            Gossip::Query
        }
        "index" => Gossip::Index(serde_json::from_value(body).map_err(deser)?),
        "fetch" => {
            let fetch: FetchBody = serde_json::from_value(body).map_err(deser)?;
            let hash = BlockHash::from_hex(&fetch.hash)
                .map_err(|e| GossipError::Deserialization(format!("hash: {e}")))?;
            Gossip::Fetch { hash }
        }
        "block" => {
            let envelope: BlockEnvelope = serde_json::from_value(body).map_err(deser)?;
            Gossip::Block(envelope.block)
        }
        "tx" => {
            let envelope: TransactionEnvelope = serde_json::from_value(body).map_err(deser)?;
            Gossip::Transaction(envelope.tx)
        }
        "passive" => {
            serde_json::from_value::<EmptyBody>(body).map_err(deser)?;
            Gossip::Passive
        }
        "forget" => {
            serde_json::from_value::<EmptyBody>(body).map_err(deser)?;
            Gossip::Forget
        }
        "error" => {
            let error: ErrorBody = serde_json::from_value(body).map_err(deser)?;
            Gossip::Error {
                message: error.message,
            }
        }
        other => return Err(GossipError::UnknownAction(other.to_string())),
    };
    Ok((counter, gossip))
}
