//! Serialized form of a mirror node
//!
//! One row per mirror node in the per-sync state cache. Rows reference their
//! parent by row id so the tree can be rebuilt bottom-up on restart; the
//! transient flags (`created`, `reported`, `checked`) are deliberately not
//! persisted.

use serde::{Deserialize, Serialize};

use super::cloud_node::NodeKind;
use super::fingerprint::FileFingerprint;
use super::newtypes::{Fsid, NodeHandle};

/// Persisted state of one mirror node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRow {
    /// Stable row id within one sync's cache.
    pub row_id: i64,
    /// Parent's row id; `None` for the sync root.
    pub parent_row: Option<i64>,
    pub kind: NodeKind,
    pub size: u64,
    pub fsid: Option<Fsid>,
    pub cloud_handle: Option<NodeHandle>,
    /// Leaf name in local encoding; the root row carries the absolute path.
    pub leaf_name: String,
    pub short_name: Option<String>,
    /// Files only.
    pub fingerprint: Option<FileFingerprint>,
    pub syncable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn row_roundtrips_through_json() {
        let row = MirrorRow {
            row_id: 17,
            parent_row: Some(3),
            kind: NodeKind::File,
            size: 1234,
            fsid: Some(Fsid::new(99)),
            cloud_handle: Some(NodeHandle::new(0xabc)),
            leaf_name: "report.pdf".into(),
            short_name: None,
            fingerprint: Some(FileFingerprint::new(
                1234,
                chrono::Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
                0xfeed,
            )),
            syncable: true,
        };
        let bytes = serde_json::to_vec(&row).unwrap();
        let back: MirrorRow = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, row);
    }
}
