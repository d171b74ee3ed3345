// Transactions: a signed SQL statement from an invoker.
//
// The statement itself is opaque to the core; execution belongs to the
// application layer. Signing bytes are invoker ‖ counter_le ‖ statement.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::hash::BlockHash;
use crate::crypto::keys::{Identity, PublicKey, SIGNATURE_BYTES, Signature};

#[derive(Clone, PartialEq)]
pub struct Transaction {
    pub invoker: PublicKey,
    /// Per-invoker sequence number; ordering across invokers is the
    /// application's concern.
    pub counter: u64,
    pub statement: String,
    pub signature: Signature,
}

impl Transaction {
    /// Build and sign a transaction with the given identity.
    pub fn new(identity: &Identity, counter: u64, statement: impl Into<String>) -> Transaction {
        let statement = statement.into();
        let message = signing_bytes(&identity.public, counter, &statement);
        let signature = identity.private.sign(&message);
        Transaction {
            invoker: identity.public,
            counter,
            statement,
            signature,
        }
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        signing_bytes(&self.invoker, self.counter, &self.statement)
    }

    pub fn is_signature_valid(&self) -> bool {
        self.invoker.verify(&self.signing_bytes(), &self.signature)
    }

    /// Dedup identity of a fully signed transaction.
    pub fn hash(&self) -> BlockHash {
        let mut buffer = self.signing_bytes();
        buffer.extend_from_slice(&self.signature.to_bytes());
        BlockHash::of(&buffer)
    }

    /// Size accounted against the per-transaction and per-block limits.
    pub fn data_size(&self) -> usize {
        self.signing_bytes().len()
    }
}

fn signing_bytes(invoker: &PublicKey, counter: u64, statement: &str) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(32 + 8 + statement.len());
    buffer.extend_from_slice(invoker.as_bytes());
    buffer.extend_from_slice(&counter.to_le_bytes());
    buffer.extend_from_slice(statement.as_bytes());
    buffer
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Transaction(invoker={} counter={} statement={:?})",
            self.invoker.hash_string(),
            self.counter,
            self.statement
        )
    }
}

// Wire shape: {"tx": {"sql": …, "counter": …, "invoker": base58check},
// "signature": base64}. Unknown fields are rejected, not tolerated.

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireTransaction {
    tx: WireStatement,
    signature: String,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireStatement {
    sql: String,
    counter: u64,
    invoker: String,
}

impl Serialize for Transaction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireTransaction {
            tx: WireStatement {
                sql: self.statement.clone(),
                counter: self.counter,
                invoker: self.invoker.to_string_checked(),
            },
            signature: data_encoding::BASE64.encode(&self.signature.to_bytes()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Transaction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireTransaction::deserialize(deserializer)?;
        let invoker = PublicKey::from_string_checked(&wire.tx.invoker)
            .map_err(|e| D::Error::custom(format!("invoker: {e}")))?;
        let sig_bytes = data_encoding::BASE64
            .decode(wire.signature.as_bytes())
            .map_err(|_| D::Error::custom("signature: invalid base64"))?;
        if sig_bytes.len() != SIGNATURE_BYTES {
            return Err(D::Error::custom("signature: wrong length"));
        }
        let mut raw = [0u8; SIGNATURE_BYTES];
        raw.copy_from_slice(&sig_bytes);
        Ok(Transaction {
            invoker,
            counter: wire.tx.counter,
            statement: wire.tx.sql,
            signature: Signature::from_bytes(&raw),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_tx() -> Transaction {
        let id = Identity::generate();
        Transaction::new(&id, 0, "INSERT INTO foo (\"x\") VALUES (?what);")
    }

    #[test]
    fn test_signature_verifies() {
        let tx = mock_tx();
        assert!(tx.is_signature_valid());
    }

    #[test]
    fn test_tampered_statement_rejected() {
        let mut tx = mock_tx();
        tx.statement.push(' ');
        assert!(!tx.is_signature_valid());
    }

    #[test]
    fn test_tampered_counter_rejected() {
        let mut tx = mock_tx();
        tx.counter += 1;
        assert!(!tx.is_signature_valid());
    }

    #[test]
    fn test_foreign_key_rejected() {
        let mut tx = mock_tx();
        tx.invoker = Identity::generate().public;
        assert!(!tx.is_signature_valid());
    }

    #[test]
    fn test_signing_bytes_layout() {
        let tx = mock_tx();
        let bytes = tx.signing_bytes();
        assert_eq!(&bytes[0..32], tx.invoker.as_bytes());
        assert_eq!(&bytes[32..40], &tx.counter.to_le_bytes());
        assert_eq!(&bytes[40..], tx.statement.as_bytes());
    }

    #[test]
    fn test_wire_roundtrip() {
        let tx = mock_tx();
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
        assert!(back.is_signature_valid());
    }

    #[test]
    fn test_unknown_wire_field_rejected() {
        let tx = mock_tx();
        let mut v: serde_json::Value = serde_json::to_value(&tx).unwrap();
        v.as_object_mut()
            .unwrap()
            .insert("extra".into(), serde_json::Value::Bool(true));
        assert!(serde_json::from_value::<Transaction>(v).is_err());
    }
}
