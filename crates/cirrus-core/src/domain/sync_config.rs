//! Sync configuration
//!
//! One `SyncConfig` pairs a local root folder with a remote root node and a
//! direction. Configs are immutable by convention once registered; the engine
//! updates only the error/enabled/backup-state fields and persists the result
//! through the config store.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::newtypes::{BackupId, NodeHandle, VolumeFingerprint};
use super::sync_error::SyncError;

// ============================================================================
// Direction and sub-states
// ============================================================================

/// Which way changes propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Local changes propagate to the cloud only.
    UpOnly,
    /// Cloud changes propagate to the local folder only.
    DownOnly,
    /// Both directions.
    TwoWay,
    /// Up-only sync that faults itself on any remote-side change.
    Backup,
}

impl SyncDirection {
    #[must_use]
    pub fn allows_up(&self) -> bool {
        matches!(
            self,
            SyncDirection::UpOnly | SyncDirection::TwoWay | SyncDirection::Backup
        )
    }

    #[must_use]
    pub fn allows_down(&self) -> bool {
        matches!(self, SyncDirection::DownOnly | SyncDirection::TwoWay)
    }

    #[must_use]
    pub fn is_backup(&self) -> bool {
        matches!(self, SyncDirection::Backup)
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SyncDirection::UpOnly => "up",
            SyncDirection::DownOnly => "down",
            SyncDirection::TwoWay => "two-way",
            SyncDirection::Backup => "backup",
        }
    }
}

/// Phase of a backup sync.
///
/// A backup starts out mirroring (bringing the remote in line with the local
/// tree) and switches to monitoring once the initial mirror completes. Remote
/// writes fault the sync in either phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    #[default]
    Mirroring,
    Monitoring,
}

/// Non-fatal condition the user should know about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncWarning {
    #[default]
    NoWarning,
    LocalIsHgfs,
    LocalIsFat,
}

/// How to resolve a both-sides-changed file whose mtimes are identical.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Keep the local version, send the remote one to version history.
    #[default]
    PreferLocal,
    /// Surface the row as a stall and wait for the user.
    Stall,
}

// ============================================================================
// SyncConfig
// ============================================================================

/// Configuration of one sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Stable key for this sync; every config has one.
    pub backup_id: BackupId,

    /// Absolute path of the local sync root.
    pub local_path: PathBuf,

    /// Display name (used where the local path is not adequate).
    pub name: String,

    /// Handle of the remote root node.
    pub remote_node: NodeHandle,

    /// Where the remote root was, last time we looked. Not definitive.
    pub remote_path_hint: String,

    /// Fingerprint of the volume holding the local root, captured when the
    /// sync was registered. Detects relocation and drive swaps.
    pub local_fingerprint: VolumeFingerprint,

    pub direction: SyncDirection,

    pub enabled: bool,

    /// Cause of the last disable/failure.
    pub error: SyncError,

    pub warning: SyncWarning,

    /// Wildcard patterns excluded from synchronization.
    pub exclusions: Vec<String>,

    /// Only meaningful when `direction` is `Backup`.
    pub backup_state: BackupState,

    /// Tie-break policy for equal-mtime conflicts.
    pub tie_break: TieBreak,

    /// Whether scans follow symbolic links.
    pub follow_symlinks: bool,

    /// Drive containing this config, for removable-drive backups.
    /// Implicit in the containing database, never serialized.
    #[serde(skip)]
    pub external_drive: Option<PathBuf>,

    // Last error/enabled values the app was told about. Used to notify
    // exactly once per change.
    #[serde(skip)]
    known_error: SyncError,
    #[serde(skip)]
    known_enabled: bool,
}

impl SyncConfig {
    pub fn new(
        backup_id: BackupId,
        local_path: PathBuf,
        name: String,
        remote_node: NodeHandle,
        remote_path_hint: String,
        direction: SyncDirection,
    ) -> Self {
        Self {
            backup_id,
            local_path,
            name,
            remote_node,
            remote_path_hint,
            local_fingerprint: VolumeFingerprint::default(),
            direction,
            enabled: true,
            error: SyncError::NoSyncError,
            warning: SyncWarning::NoWarning,
            exclusions: Vec::new(),
            backup_state: BackupState::Mirroring,
            tie_break: TieBreak::PreferLocal,
            follow_symlinks: false,
            external_drive: None,
            known_error: SyncError::NoSyncError,
            known_enabled: false,
        }
    }

    #[must_use]
    pub fn is_backup(&self) -> bool {
        self.direction.is_backup()
    }

    /// Whether this config lives on an external drive.
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.external_drive.is_some()
    }

    /// Returns true when the error or enabled flag differs from what the app
    /// was last told, and records the new values. Callers notify the app
    /// exactly when this returns true.
    pub fn error_or_enabled_changed(&mut self) -> bool {
        let changed = self.error != self.known_error || self.enabled != self.known_enabled;
        if changed {
            self.known_error = self.error;
            self.known_enabled = self.enabled;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SyncConfig {
        SyncConfig::new(
            BackupId::new(1),
            PathBuf::from("/home/user/Sync"),
            "Sync".to_string(),
            NodeHandle::new(42),
            "/Sync".to_string(),
            SyncDirection::TwoWay,
        )
    }

    #[test]
    fn direction_propagation_rules() {
        assert!(SyncDirection::Backup.allows_up());
        assert!(!SyncDirection::Backup.allows_down());
        assert!(SyncDirection::TwoWay.allows_up());
        assert!(SyncDirection::TwoWay.allows_down());
        assert!(!SyncDirection::DownOnly.allows_up());
    }

    #[test]
    fn error_or_enabled_changed_fires_once_per_change() {
        let mut c = config();
        // enabled starts true, known_enabled false: first call reports a change
        assert!(c.error_or_enabled_changed());
        assert!(!c.error_or_enabled_changed());

        c.error = SyncError::BackupModified;
        assert!(c.error_or_enabled_changed());
        assert!(!c.error_or_enabled_changed());
    }

    #[test]
    fn external_drive_is_not_serialized() {
        let mut c = config();
        c.external_drive = Some(PathBuf::from("/mnt/usb"));
        let json = serde_json::to_string(&c).unwrap();
        let back: SyncConfig = serde_json::from_str(&json).unwrap();
        assert!(back.external_drive.is_none());
        assert_eq!(back.backup_id, c.backup_id);
        assert_eq!(back.local_path, c.local_path);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let mut c = config();
        c.exclusions = vec!["*.tmp".into(), ".git/**".into()];
        c.enabled = false;
        c.error = SyncError::Stalled;
        let json = serde_json::to_string(&c).unwrap();
        let back: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
