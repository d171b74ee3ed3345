// Block payload seam.
//
// The core never interprets statements; it only needs deterministic bytes
// for signing, a wire form, and room/validity checks while the miner fills
// a template. The SQL application supplies its own implementation;
// TransactionPayload below is the reference one used by the daemon and the
// test suite.

use crate::config::Limits;
use crate::crypto::keys::{PublicKey, SIGNATURE_BYTES, Signature};
use crate::primitives::transaction::Transaction;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("truncated payload")]
    Truncated,
    #[error("payload field out of range")]
    OutOfRange,
    #[error("invalid key or signature bytes in payload")]
    BadKeyMaterial,
    #[error("statement is not valid UTF-8")]
    BadStatement,
}

pub trait Payload: Clone + Send + Sync + 'static {
    /// Payload of a freshly created template block, before any transaction
    /// is appended.
    fn empty() -> Self;

    /// Genesis payloads carry the chain's seed bytes verbatim; they are
    /// never decoded as a transaction list.
    fn genesis(seed: &[u8]) -> Self;

    /// Parse a non-genesis payload from its wire bytes.
    fn decode(data: &[u8]) -> Result<Self, PayloadError>;

    /// Wire form, as gossiped inside `block` messages.
    fn encode(&self) -> Vec<u8>;

    /// Deterministic byte form hashed into the block signature. May differ
    /// from the wire form.
    fn signing_bytes(&self) -> Vec<u8>;

    fn transactions(&self) -> &[Transaction];

    /// Consulted before `append`; also enforced by `append` itself.
    fn has_room_for(&self, tx: &Transaction, limits: &Limits) -> bool;

    /// Returns false when the payload refuses the transaction (no room, or
    /// a duplicate).
    fn append(&mut self, tx: &Transaction, limits: &Limits) -> bool;

    /// Structural validity: every carried transaction must verify.
    fn is_valid(&self) -> bool;
}

/// Reference payload: an ordered transaction list. The signing form is the
/// concatenation of the member transactions' signing bytes, so a block
/// signature commits to exactly the statements it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionPayload {
    seed: Option<Vec<u8>>,
    transactions: Vec<Transaction>,
}

impl TransactionPayload {
    pub fn seed(&self) -> Option<&[u8]> {
        self.seed.as_deref()
    }
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn read_u32(d: &[u8], off: &mut usize) -> Result<u32, PayloadError> {
    if d.len() < *off + 4 {
        return Err(PayloadError::Truncated);
    }
    let v = u32::from_le_bytes(d[*off..*off + 4].try_into().unwrap());
    *off += 4;
    Ok(v)
}

fn read_u64(d: &[u8], off: &mut usize) -> Result<u64, PayloadError> {
    if d.len() < *off + 8 {
        return Err(PayloadError::Truncated);
    }
    let v = u64::from_le_bytes(d[*off..*off + 8].try_into().unwrap());
    *off += 8;
    Ok(v)
}

fn read_exact<'a>(d: &'a [u8], off: &mut usize, len: usize) -> Result<&'a [u8], PayloadError> {
    if d.len() < *off + len {
        return Err(PayloadError::Truncated);
    }
    let out = &d[*off..*off + len];
    *off += len;
    Ok(out)
}

impl Payload for TransactionPayload {
    fn empty() -> Self {
        TransactionPayload {
            seed: None,
            transactions: Vec::new(),
        }
    }

    fn genesis(seed: &[u8]) -> Self {
        TransactionPayload {
            seed: Some(seed.to_vec()),
            transactions: Vec::new(),
        }
    }

    fn decode(data: &[u8]) -> Result<Self, PayloadError> {
        let mut off = 0usize;
        let count = read_u32(data, &mut off)? as usize;
        // A count beyond what the data could possibly hold is garbage.
        if count > data.len() / (32 + 8 + SIGNATURE_BYTES) + 1 {
            return Err(PayloadError::OutOfRange);
        }
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            let invoker = PublicKey::from_bytes(read_exact(data, &mut off, 32)?)
                .map_err(|_| PayloadError::BadKeyMaterial)?;
            let counter = read_u64(data, &mut off)?;
            let sig_raw: [u8; SIGNATURE_BYTES] = read_exact(data, &mut off, SIGNATURE_BYTES)?
                .try_into()
                .unwrap();
            let stmt_len = read_u32(data, &mut off)? as usize;
            let statement = std::str::from_utf8(read_exact(data, &mut off, stmt_len)?)
                .map_err(|_| PayloadError::BadStatement)?
                .to_string();
            transactions.push(Transaction {
                invoker,
                counter,
                statement,
                signature: Signature::from_bytes(&sig_raw),
            });
        }
        if off != data.len() {
            return Err(PayloadError::OutOfRange);
        }
        Ok(TransactionPayload {
            seed: None,
            transactions,
        })
    }

    fn encode(&self) -> Vec<u8> {
        if let Some(seed) = &self.seed {
            return seed.clone();
        }
        let mut buf = Vec::new();
        write_u32(&mut buf, self.transactions.len() as u32);
        for tx in &self.transactions {
            buf.extend_from_slice(tx.invoker.as_bytes());
            write_u64(&mut buf, tx.counter);
            buf.extend_from_slice(&tx.signature.to_bytes());
            write_u32(&mut buf, tx.statement.len() as u32);
            buf.extend_from_slice(tx.statement.as_bytes());
        }
        buf
    }

    fn signing_bytes(&self) -> Vec<u8> {
        if let Some(seed) = &self.seed {
            return seed.clone();
        }
        let mut buf = Vec::new();
        for tx in &self.transactions {
            buf.extend_from_slice(&tx.signing_bytes());
        }
        buf
    }

    fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    fn has_room_for(&self, tx: &Transaction, limits: &Limits) -> bool {
        if self.seed.is_some() {
            return false;
        }
        if self.transactions.len() >= limits.max_block_transactions {
            return false;
        }
        let size = tx.data_size();
        if size > limits.max_transaction_bytes {
            return false;
        }
        let current: usize = self.transactions.iter().map(|t| t.data_size()).sum();
        current + size <= limits.max_payload_bytes
    }

    fn append(&mut self, tx: &Transaction, limits: &Limits) -> bool {
        if !self.has_room_for(tx, limits) {
            return false;
        }
        if self.transactions.iter().any(|t| t.hash() == tx.hash()) {
            return false;
        }
        self.transactions.push(tx.clone());
        true
    }

    fn is_valid(&self) -> bool {
        self.transactions.iter().all(|t| t.is_signature_valid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::Identity;

    fn mock_tx(counter: u64) -> Transaction {
        let id = Identity::generate();
        Transaction::new(&id, counter, format!("SELECT {counter};"))
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let limits = Limits::default();
        let mut p = TransactionPayload::empty();
        assert!(p.append(&mock_tx(0), &limits));
        assert!(p.append(&mock_tx(1), &limits));

        let back = TransactionPayload::decode(&p.encode()).unwrap();
        assert_eq!(back, p);
        assert!(back.is_valid());
    }

    #[test]
    fn test_signing_bytes_is_concatenation() {
        let limits = Limits::default();
        let a = mock_tx(0);
        let b = mock_tx(1);
        let mut p = TransactionPayload::empty();
        p.append(&a, &limits);
        p.append(&b, &limits);

        let mut expected = a.signing_bytes();
        expected.extend_from_slice(&b.signing_bytes());
        assert_eq!(p.signing_bytes(), expected);
    }

    #[test]
    fn test_duplicate_refused() {
        let limits = Limits::default();
        let tx = mock_tx(0);
        let mut p = TransactionPayload::empty();
        assert!(p.append(&tx, &limits));
        assert!(!p.append(&tx, &limits));
        assert_eq!(p.transactions().len(), 1);
    }

    #[test]
    fn test_transaction_count_limit() {
        let limits = Limits {
            max_block_transactions: 2,
            ..Limits::default()
        };
        let mut p = TransactionPayload::empty();
        assert!(p.append(&mock_tx(0), &limits));
        assert!(p.append(&mock_tx(1), &limits));
        let third = mock_tx(2);
        assert!(!p.has_room_for(&third, &limits));
        assert!(!p.append(&third, &limits));
    }

    #[test]
    fn test_oversized_transaction_refused() {
        let limits = Limits {
            max_transaction_bytes: 64,
            ..Limits::default()
        };
        let id = Identity::generate();
        let big = Transaction::new(&id, 0, "x".repeat(512));
        let p = TransactionPayload::empty();
        assert!(!p.has_room_for(&big, &limits));
    }

    #[test]
    fn test_genesis_payload_carries_seed() {
        let p = TransactionPayload::genesis(b"make it so");
        assert_eq!(p.encode(), b"make it so");
        assert_eq!(p.signing_bytes(), b"make it so");
        assert!(p.transactions().is_empty());
        assert!(!p.clone().append(&mock_tx(0), &Limits::default()));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let limits = Limits::default();
        let mut p = TransactionPayload::empty();
        p.append(&mock_tx(0), &limits);
        let mut bytes = p.encode();
        bytes.truncate(bytes.len() - 3);
        assert_eq!(
            TransactionPayload::decode(&bytes),
            Err(PayloadError::Truncated)
        );
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut bytes = TransactionPayload::empty().encode();
        bytes.push(0xAB);
        assert_eq!(
            TransactionPayload::decode(&bytes),
            Err(PayloadError::OutOfRange)
        );
    }
}
