//! Point-in-time filesystem snapshots
//!
//! [`stat`] and [`read_dir_entries`] are the only ways the sync core looks at
//! the disk. Both return plain data: the scanner and the engine never hold
//! open handles into the tree they reconcile.

use std::path::Path;

use chrono::{DateTime, Utc};

use cirrus_core::domain::{FileFingerprint, Fsid, NodeKind, VolumeFingerprint};

use crate::FsError;

/// Result of a single `stat`.
#[derive(Debug, Clone)]
pub struct FsStat {
    pub kind: NodeKind,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub fsid: Fsid,
    pub is_symlink: bool,
}

/// Snapshot record for one directory entry, as produced by the scanner.
#[derive(Debug, Clone)]
pub struct FsEntry {
    /// Leaf name in local encoding (UTF-8; non-UTF-8 names are skipped).
    pub name: String,
    /// 8.3-style alias where the platform provides one.
    pub short_name: Option<String>,
    pub kind: NodeKind,
    pub fsid: Fsid,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub is_symlink: bool,
    /// Content fingerprint, computed only when the scan requested it.
    pub fingerprint: Option<FileFingerprint>,
}

/// Stats a path without following a trailing symlink.
pub fn stat(path: &Path) -> Result<FsStat, FsError> {
    let meta = std::fs::symlink_metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => FsError::NotFound(path.to_path_buf()),
        _ => FsError::io(path, e),
    })?;

    let is_symlink = meta.file_type().is_symlink();
    let kind = if meta.is_dir() {
        NodeKind::Folder
    } else {
        NodeKind::File
    };
    let mtime: DateTime<Utc> = meta
        .modified()
        .map(Into::into)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    Ok(FsStat {
        kind,
        size: if meta.is_dir() { 0 } else { meta.len() },
        mtime,
        fsid: fsid_of(&meta),
        is_symlink,
    })
}

/// Enumerates the entries of `dir`.
///
/// Symlinks are reported with `is_symlink = true` and the link's own
/// metadata; callers decide whether to follow. Files are fingerprinted when
/// `fingerprint_files` is set. Entries that vanish mid-enumeration are
/// skipped rather than failing the whole scan.
pub fn read_dir_entries(dir: &Path, fingerprint_files: bool) -> Result<Vec<FsEntry>, FsError> {
    let rd = std::fs::read_dir(dir).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => FsError::NotFound(dir.to_path_buf()),
        _ => FsError::io(dir, e),
    })?;

    let mut entries = Vec::new();
    for item in rd {
        let item = match item {
            Ok(i) => i,
            Err(_) => continue,
        };
        let Some(name) = item.file_name().to_str().map(str::to_string) else {
            tracing::warn!(dir = %dir.display(), "skipping non-UTF-8 directory entry");
            continue;
        };
        let path = item.path();
        let Ok(st) = stat(&path) else {
            continue;
        };

        let fingerprint = if fingerprint_files && st.kind == NodeKind::File && !st.is_symlink {
            FileFingerprint::of_file(&path).ok()
        } else {
            None
        };

        entries.push(FsEntry {
            name,
            short_name: None,
            kind: st.kind,
            fsid: st.fsid,
            size: st.size,
            mtime: st.mtime,
            is_symlink: st.is_symlink,
            fingerprint,
        });
    }

    Ok(entries)
}

/// Captures the volume fingerprint of a sync root: its fsid plus a volume
/// signature, used to detect relocation between runs.
pub fn volume_fingerprint(root: &Path) -> Result<VolumeFingerprint, FsError> {
    let st = stat(root)?;
    Ok(VolumeFingerprint::new(
        st.fsid.as_u64(),
        volume_signature(root),
    ))
}

#[cfg(unix)]
fn fsid_of(meta: &std::fs::Metadata) -> Fsid {
    use std::os::unix::fs::MetadataExt;
    Fsid::new(meta.ino())
}

#[cfg(not(unix))]
fn fsid_of(_meta: &std::fs::Metadata) -> Fsid {
    Fsid::new(0)
}

#[cfg(target_os = "linux")]
fn volume_signature(path: &Path) -> u64 {
    use std::os::unix::ffi::OsStrExt;

    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return 0;
    };
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(cpath.as_ptr(), &mut stat) } != 0 {
        return 0;
    }
    let val = unsafe { std::mem::transmute::<libc::fsid_t, [i32; 2]>(stat.f_fsid) };
    ((val[0] as u32 as u64) << 32) | val[1] as u32 as u64
}

#[cfg(not(target_os = "linux"))]
fn volume_signature(_path: &Path) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_reports_kind_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"12345").unwrap();

        let st = stat(&file).unwrap();
        assert_eq!(st.kind, NodeKind::File);
        assert_eq!(st.size, 5);

        let st = stat(dir.path()).unwrap();
        assert_eq!(st.kind, NodeKind::Folder);
        assert_eq!(st.size, 0);
    }

    #[test]
    fn stat_missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = stat(&dir.path().join("gone")).unwrap_err();
        assert!(matches!(err, FsError::NotFound(_)));
    }

    #[test]
    fn read_dir_lists_entries_with_distinct_fsids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"a").unwrap();
        std::fs::write(dir.path().join("b"), b"bb").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let mut entries = read_dir_entries(dir.path(), true).unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "a");
        assert!(entries[0].fingerprint.is_some());
        assert_eq!(entries[2].kind, NodeKind::Folder);
        assert!(entries[2].fingerprint.is_none());
        assert_ne!(entries[0].fsid, entries[1].fsid);
    }

    #[test]
    fn volume_fingerprint_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let a = volume_fingerprint(dir.path()).unwrap();
        let b = volume_fingerprint(dir.path()).unwrap();
        assert_eq!(a, b);
        assert!(!a.is_unset());
    }
}
