use loro::{ExportMode, LoroDoc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrdtError {
    #[error("Failed to import update: {0}")]
    Import(String),
    #[error("Failed to export state: {0}")]
    Export(String),
}

/// Opaque CRDT state for one document.
///
/// Only three operations are exposed: load from a snapshot, merge an update and encode the
/// full state. Merging is commutative and idempotent, so replays and broker re-deliveries
/// converge.
pub struct CrdtDoc {
    doc: LoroDoc,
}

impl CrdtDoc {
    pub fn new() -> Self {
        Self { doc: LoroDoc::new() }
    }

    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, CrdtError> {
        let crdt = Self::new();
        if !snapshot.is_empty() {
            crdt.apply_update(snapshot)?;
        }
        Ok(crdt)
    }

    pub fn apply_update(&self, update: &[u8]) -> Result<(), CrdtError> {
        self.doc
            .import(update)
            .map(|_| ())
            .map_err(|e| CrdtError::Import(e.to_string()))
    }

    pub fn encode_state(&self) -> Result<Vec<u8>, CrdtError> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| CrdtError::Export(e.to_string()))
    }
}

impl Default for CrdtDoc {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a standalone update inserting `text` into the "text" container. Test helper.
#[cfg(test)]
pub fn text_update(peer: u64, text: &str) -> Vec<u8> {
    let doc = LoroDoc::new();
    doc.set_peer_id(peer).unwrap();
    doc.get_text("text").insert(0, text).unwrap();
    doc.commit();
    doc.export(ExportMode::all_updates()).unwrap()
}

/// Read back the "text" container of an encoded state. Test helper.
#[cfg(test)]
pub fn text_of(state: &[u8]) -> String {
    let doc = LoroDoc::new();
    doc.import(state).unwrap();
    doc.get_text("text").to_string()
}
