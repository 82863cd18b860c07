//! Triplet construction
//!
//! At each folder the engine aligns three child sets into one row per
//! comparison name: the cloud children, the mirror children, and the
//! filesystem children. Names compare NFC-normalized, case-folded on
//! case-insensitive filesystems, so `a.txt` and `A.TXT` land in the same row
//! instead of producing a phantom delete+create.
//!
//! Duplicate names on one side (two cloud files differing only in case, on a
//! case-insensitive disk) are clashes: they park in the row's clash lists,
//! recursion is suppressed, and the row stalls until the user resolves it.
//!
//! Cloud names are escaped into their local form before comparison: mirror
//! and filesystem children already carry escaped leaf names, so a cloud
//! `a:b` must key as `a%3ab` on an APFS sync or it would never pair with
//! its own local copy.

use std::collections::BTreeMap;

use cirrus_core::domain::CloudNode;
use cirrus_fs::{escape_name, normalize_nfc, FsEntry, FsKind};

use crate::mirror::MirrorId;

/// One reconciliation row: up to one entity per side, same comparison name.
#[derive(Debug, Default)]
pub struct SyncRow {
    pub cloud: Option<CloudNode>,
    pub mirror: Option<MirrorId>,
    pub fs: Option<FsEntry>,
    /// Cloud-side entries beyond the first for this name.
    pub cloud_clashes: Vec<CloudNode>,
    /// Filesystem-side entries beyond the first for this name.
    pub fs_clashes: Vec<FsEntry>,
    /// Set when this row must not recurse (clashes, stalled).
    pub suppress_recursion: bool,
}

impl SyncRow {
    #[must_use]
    pub fn has_clashes(&self) -> bool {
        !self.cloud_clashes.is_empty() || !self.fs_clashes.is_empty()
    }

    /// Best display name for logs and stall reports.
    #[must_use]
    pub fn display_name(&self) -> String {
        if let Some(fs) = &self.fs {
            return fs.name.clone();
        }
        if let Some(cloud) = &self.cloud {
            return cloud.name.clone();
        }
        String::new()
    }
}

/// Comparison key for one name.
#[must_use]
pub fn name_key(name: &str, case_insensitive: bool) -> String {
    let normalized = normalize_nfc(name);
    if case_insensitive {
        normalized.to_lowercase()
    } else {
        normalized
    }
}

/// Builds one row per comparison name from the three child sets.
///
/// Cloud names are keyed by their escaped local form for `fs_kind`, so a
/// cloud entity joins the row of the mirror/fs entry it maps to on disk.
/// Output order is deterministic (sorted by comparison name), which fixes
/// the visiting order of the whole tick.
#[must_use]
pub fn compute_sync_triplets(
    cloud_children: Vec<CloudNode>,
    mirror_children: Vec<(String, MirrorId)>,
    fs_children: Vec<FsEntry>,
    fs_kind: FsKind,
    case_insensitive: bool,
) -> Vec<SyncRow> {
    let mut rows: BTreeMap<String, SyncRow> = BTreeMap::new();

    for (leaf_name, id) in mirror_children {
        let key = name_key(&leaf_name, case_insensitive);
        let row = rows.entry(key).or_default();
        // Mirror children are unique per key by construction.
        row.mirror = Some(id);
    }

    for node in cloud_children {
        let key = name_key(&escape_name(&node.name, fs_kind), case_insensitive);
        let row = rows.entry(key).or_default();
        if row.cloud.is_none() {
            row.cloud = Some(node);
        } else {
            row.cloud_clashes.push(node);
            row.suppress_recursion = true;
        }
    }

    for entry in fs_children {
        let key = name_key(&entry.name, case_insensitive);
        let row = rows.entry(key).or_default();
        if row.fs.is_none() {
            row.fs = Some(entry);
        } else {
            row.fs_clashes.push(entry);
            row.suppress_recursion = true;
        }
    }

    rows.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cirrus_core::domain::{Fsid, NodeHandle, NodeKind};

    fn cloud(h: u64, name: &str) -> CloudNode {
        CloudNode::folder(NodeHandle::new(h), Some(NodeHandle::new(1)), name)
    }

    fn fs(name: &str) -> FsEntry {
        FsEntry {
            name: name.to_string(),
            short_name: None,
            kind: NodeKind::File,
            fsid: Fsid::new(1),
            size: 0,
            mtime: Utc::now(),
            is_symlink: false,
            fingerprint: None,
        }
    }

    #[test]
    fn three_sides_align_by_name() {
        let rows = compute_sync_triplets(
            vec![cloud(2, "a"), cloud(3, "b")],
            vec![("b".into(), MirrorId(10)), ("c".into(), MirrorId(11))],
            vec![fs("c"), fs("d")],
            FsKind::Ext,
            false,
        );
        assert_eq!(rows.len(), 4);
        // Sorted by key: a, b, c, d
        assert!(rows[0].cloud.is_some() && rows[0].mirror.is_none() && rows[0].fs.is_none());
        assert!(rows[1].cloud.is_some() && rows[1].mirror.is_some() && rows[1].fs.is_none());
        assert!(rows[2].cloud.is_none() && rows[2].mirror.is_some() && rows[2].fs.is_some());
        assert!(rows[3].fs.is_some() && rows[3].mirror.is_none() && rows[3].cloud.is_none());
    }

    #[test]
    fn case_folding_joins_rows_on_case_insensitive_fs() {
        let rows = compute_sync_triplets(
            vec![cloud(2, "File.TXT")],
            vec![],
            vec![fs("file.txt")],
            FsKind::Ntfs,
            true,
        );
        assert_eq!(rows.len(), 1);
        assert!(rows[0].cloud.is_some() && rows[0].fs.is_some());
        assert!(!rows[0].has_clashes());
    }

    #[test]
    fn case_sensitive_fs_keeps_rows_apart() {
        let rows = compute_sync_triplets(
            vec![cloud(2, "File.TXT")],
            vec![],
            vec![fs("file.txt")],
            FsKind::Ext,
            false,
        );
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn nfc_normalization_joins_rows() {
        // Same name, composed vs decomposed.
        let rows = compute_sync_triplets(
            vec![cloud(2, "caf\u{00e9}")],
            vec![],
            vec![fs("cafe\u{0301}")],
            FsKind::Ext,
            false,
        );
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn forbidden_byte_cloud_name_joins_its_escaped_local_row() {
        // A cloud "a:b" lives on disk as "a%3ab" on an APFS sync; all three
        // sides must land in one row.
        let local = escape_name("a:b", FsKind::Apfs);
        assert_eq!(local, "a%3ab");
        let rows = compute_sync_triplets(
            vec![cloud(2, "a:b")],
            vec![(local.clone(), MirrorId(7))],
            vec![fs(&local)],
            FsKind::Apfs,
            true,
        );
        assert_eq!(rows.len(), 1);
        assert!(rows[0].cloud.is_some());
        assert_eq!(rows[0].mirror, Some(MirrorId(7)));
        assert!(rows[0].fs.is_some());
        assert!(!rows[0].has_clashes());
    }

    #[test]
    fn duplicate_cloud_names_become_clashes() {
        let rows = compute_sync_triplets(
            vec![cloud(2, "Dup"), cloud(3, "dup")],
            vec![],
            vec![],
            FsKind::Ntfs,
            true,
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cloud_clashes.len(), 1);
        assert!(rows[0].suppress_recursion);
    }

    #[test]
    fn duplicate_fs_names_become_clashes() {
        let rows = compute_sync_triplets(vec![], vec![], vec![fs("X"), fs("x")], FsKind::Ntfs, true);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fs_clashes.len(), 1);
    }

    #[test]
    fn each_name_appears_at_most_once() {
        let rows = compute_sync_triplets(
            vec![cloud(2, "N"), cloud(3, "n")],
            vec![("n".into(), MirrorId(5))],
            vec![fs("N"), fs("n")],
            FsKind::Ntfs,
            true,
        );
        assert_eq!(rows.len(), 1);
    }
}
