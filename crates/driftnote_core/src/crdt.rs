//! CRDT library collaborator interface.
//!
//! The engine treats the CRDT as a black box: updates are opaque byte blobs
//! that can be applied in any order to produce a convergent state. Only the
//! operations below are relied upon, so the library sits behind one vtable.
//! The shipped implementation is [yrs](https://crates.io/crates/yrs).

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::{Result, StoreError};

/// An opaque CRDT document.
pub trait CrdtDoc: Send {
    /// Apply one encoded update.
    fn apply_update(&mut self, update: &[u8]) -> Result<()>;

    /// Encode the full document state as a single update.
    fn encode_state(&self) -> Vec<u8>;

    /// Encode the document's state vector.
    fn encode_state_vector(&self) -> Vec<u8>;

    /// Encode the state missing from a peer described by `state_vector`.
    fn encode_diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>>;
}

/// Creates empty documents. One factory per process is enough.
pub trait CrdtFactory: Send + Sync {
    /// Create a new, empty document.
    fn new_doc(&self) -> Box<dyn CrdtDoc>;
}

/// The yrs-backed CRDT factory.
#[derive(Debug, Clone, Copy, Default)]
pub struct YrsCrdt;

impl YrsCrdt {
    /// Create the factory.
    pub fn new() -> Self {
        Self
    }
}

impl CrdtFactory for YrsCrdt {
    fn new_doc(&self) -> Box<dyn CrdtDoc> {
        Box::new(YrsDoc { doc: Doc::new() })
    }
}

/// A yrs document satisfying [`CrdtDoc`].
pub struct YrsDoc {
    doc: Doc,
}

impl CrdtDoc for YrsDoc {
    fn apply_update(&mut self, update: &[u8]) -> Result<()> {
        let update = Update::decode_v1(update).map_err(|e| StoreError::Crdt(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| StoreError::Crdt(e.to_string()))
    }

    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn encode_diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(state_vector).map_err(|e| StoreError::Crdt(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text};

    fn text_update(content: &str) -> Vec<u8> {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("body");
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, content);
        drop(txn);
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn read_body(state: &[u8]) -> String {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("body");
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
        drop(txn);
        let txn = doc.transact();
        text.get_string(&txn)
    }

    #[test]
    fn apply_and_encode_roundtrip() {
        let factory = YrsCrdt::new();
        let mut doc = factory.new_doc();
        doc.apply_update(&text_update("hello")).unwrap();
        assert_eq!(read_body(&doc.encode_state()), "hello");
    }

    #[test]
    fn diff_since_returns_missing_state() {
        let factory = YrsCrdt::new();
        let mut ours = factory.new_doc();
        ours.apply_update(&text_update("hello")).unwrap();

        // An empty peer is missing everything.
        let empty_sv = factory.new_doc().encode_state_vector();
        let diff = ours.encode_diff_since(&empty_sv).unwrap();

        let mut peer = factory.new_doc();
        peer.apply_update(&diff).unwrap();
        assert_eq!(read_body(&peer.encode_state()), "hello");

        // A caught-up peer is missing nothing material.
        let caught_up = ours.encode_diff_since(&ours.encode_state_vector()).unwrap();
        let mut third = factory.new_doc();
        third.apply_update(&caught_up).unwrap();
        assert_eq!(read_body(&third.encode_state()), "");
    }

    #[test]
    fn garbage_update_is_rejected() {
        let factory = YrsCrdt::new();
        let mut doc = factory.new_doc();
        assert!(matches!(
            doc.apply_update(&[0xff, 0xfe, 0xfd]),
            Err(StoreError::Crdt(_))
        ));
    }
}
