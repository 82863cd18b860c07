//! Filesystem families and their name restrictions
//!
//! Different filesystem families forbid different bytes in names. The table
//! here drives the `%xx` escaping in [`crate::escape`]: a byte is escaped
//! exactly when `is_name_byte_allowed` rejects it for the target family.

use std::path::Path;

/// Filesystem family of a mount point, grouped by restricted charset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsKind {
    Apfs,
    Hfs,
    Ext,
    Fat32,
    ExFat,
    Ntfs,
    /// Unknown family; uses the restrictive NTFS charset to stay safe.
    Default,
}

impl FsKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            FsKind::Apfs => "APFS",
            FsKind::Hfs => "HFS",
            FsKind::Ext => "EXT",
            FsKind::Fat32 => "FAT32",
            FsKind::ExFat => "EXFAT",
            FsKind::Ntfs => "NTFS",
            FsKind::Default => "DEFAULT",
        }
    }

    /// Whether names on this filesystem compare case-insensitively.
    ///
    /// Determines the comparison key used when matching local names against
    /// cloud names; getting this wrong turns a case-only rename into a
    /// delete+create.
    #[must_use]
    pub fn is_case_insensitive(&self) -> bool {
        matches!(
            self,
            FsKind::Apfs | FsKind::Hfs | FsKind::Fat32 | FsKind::ExFat | FsKind::Ntfs
        )
    }

    /// Whether the family reports stable filesystem ids. FAT does not, which
    /// degrades move detection to name matching.
    #[must_use]
    pub fn has_stable_fsids(&self) -> bool {
        !matches!(self, FsKind::Fat32 | FsKind::ExFat)
    }
}

/// Whether `byte` may appear in a name on `kind`.
///
/// Only single-byte (ASCII) values are ever rejected; multi-byte UTF-8
/// sequences pass through escaping untouched.
#[must_use]
pub fn is_name_byte_allowed(byte: u8, kind: FsKind) -> bool {
    match kind {
        // APFS, HFS, HFS+ restrict ':'
        FsKind::Apfs | FsKind::Hfs => byte != b':',
        // ext2/3/4 restrict '/' and NUL
        FsKind::Ext => byte != 0 && byte != b'/',
        // FAT32 restricts " * / : < > ? \ | + , . ; = [ ]
        FsKind::Fat32 => !br#""*/:<>?\|+,.;=[]"#.contains(&byte),
        // exFAT and NTFS restrict " * / : < > ? \ | ; unknown filesystems
        // use the same set to stay portable.
        FsKind::ExFat | FsKind::Ntfs | FsKind::Default => !br#""*/:<>?\|"#.contains(&byte),
    }
}

/// Detects the filesystem family containing `path`.
#[cfg(target_os = "linux")]
pub fn detect_fs_kind(path: &Path) -> FsKind {
    use std::os::unix::ffi::OsStrExt;

    // statfs magic numbers, from linux/magic.h
    const EXT4_SUPER_MAGIC: i64 = 0xef53;
    const MSDOS_SUPER_MAGIC: i64 = 0x4d44;
    const EXFAT_SUPER_MAGIC: i64 = 0x2011_bab0;
    const HFS_SUPER_MAGIC: i64 = 0x4244;
    const NTFS_SB_MAGIC: i64 = 0x5346_544e;

    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return FsKind::Default;
    };

    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(cpath.as_ptr(), &mut stat) } != 0 {
        return FsKind::Default;
    }

    match stat.f_type as i64 {
        EXT4_SUPER_MAGIC => FsKind::Ext,
        MSDOS_SUPER_MAGIC => FsKind::Fat32,
        EXFAT_SUPER_MAGIC => FsKind::ExFat,
        HFS_SUPER_MAGIC => FsKind::Hfs,
        NTFS_SB_MAGIC => FsKind::Ntfs,
        _ => FsKind::Default,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn detect_fs_kind(_path: &Path) -> FsKind {
    FsKind::Default
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colon_forbidden_on_apple_families() {
        assert!(!is_name_byte_allowed(b':', FsKind::Apfs));
        assert!(!is_name_byte_allowed(b':', FsKind::Hfs));
        assert!(is_name_byte_allowed(b'?', FsKind::Apfs));
    }

    #[test]
    fn ext_allows_almost_everything() {
        assert!(!is_name_byte_allowed(b'/', FsKind::Ext));
        assert!(!is_name_byte_allowed(0, FsKind::Ext));
        assert!(is_name_byte_allowed(b':', FsKind::Ext));
        assert!(is_name_byte_allowed(b'*', FsKind::Ext));
    }

    #[test]
    fn fat32_superset_of_ntfs() {
        for b in br#""*/:<>?\|"# {
            assert!(!is_name_byte_allowed(*b, FsKind::Ntfs));
            assert!(!is_name_byte_allowed(*b, FsKind::Fat32));
        }
        for b in br#"+,.;=[]"# {
            assert!(!is_name_byte_allowed(*b, FsKind::Fat32));
            assert!(is_name_byte_allowed(*b, FsKind::Ntfs), "{}", *b as char);
        }
    }

    #[test]
    fn unknown_family_is_restrictive() {
        assert!(!is_name_byte_allowed(b'|', FsKind::Default));
    }

    #[test]
    fn detect_does_not_panic_on_missing_path() {
        let kind = detect_fs_kind(Path::new("/definitely/not/here"));
        assert_eq!(kind, FsKind::Default);
    }
}
