//! Per-drive sync-config store
//!
//! Tracks one config database per drive (plus the internal one under the
//! client's db directory), rotates write slots, and remembers which drives
//! have unflushed changes. The internal drive is keyed by the empty path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use cirrus_core::domain::SyncConfig;

use crate::io_context::{SyncConfigIoContext, MAX_SLOTS};
use crate::StoreError;

/// Subdirectory of the client db holding the internal config database.
pub const INTERNAL_DB_DIR: &str = "syncconfigs";

#[derive(Debug)]
struct DriveInfo {
    /// Directory containing the slot files.
    db_path: PathBuf,
    /// The slot most recently written or read; the next write targets
    /// `(slot + 1) % MAX_SLOTS`.
    slot: u32,
    dirty: bool,
}

/// The set of known config databases, one per drive.
pub struct SyncConfigStore {
    io: SyncConfigIoContext,
    internal_db_path: PathBuf,
    /// Keyed by drive path; the internal database uses the empty path.
    drives: BTreeMap<PathBuf, DriveInfo>,
}

impl SyncConfigStore {
    /// `client_db_path` is the client's database directory; the internal
    /// config DB lives in its `syncconfigs/` subdirectory.
    pub fn new(client_db_path: &Path, io: SyncConfigIoContext) -> Self {
        Self {
            io,
            internal_db_path: client_db_path.join(INTERNAL_DB_DIR),
            drives: BTreeMap::new(),
        }
    }

    /// Database directory for a drive (empty path = internal).
    fn db_path(&self, drive: &Path) -> PathBuf {
        if drive.as_os_str().is_empty() {
            self.internal_db_path.clone()
        } else {
            drive.to_path_buf()
        }
    }

    /// Whether configs were read from (or written to) this drive already.
    #[must_use]
    pub fn drive_known(&self, drive: &Path) -> bool {
        self.drives.contains_key(drive)
    }

    /// Every known drive, internal first.
    #[must_use]
    pub fn known_drives(&self) -> Vec<PathBuf> {
        self.drives.keys().cloned().collect()
    }

    /// Remembers that this drive's configs changed and need a flush.
    pub fn mark_drive_dirty(&mut self, drive: &Path) {
        let db_path = self.db_path(drive);
        let info = self.drives.entry(drive.to_path_buf()).or_insert(DriveInfo {
            db_path,
            slot: MAX_SLOTS - 1,
            dirty: false,
        });
        info.dirty = true;
    }

    /// Whether any drive has unflushed changes.
    #[must_use]
    pub fn dirty(&self) -> bool {
        self.drives.values().any(|d| d.dirty)
    }

    /// Reads a drive's database, trying slots newest-first and keeping the
    /// first that verifies. Installs the drive as known on success.
    pub fn read(&mut self, drive: &Path) -> Result<Vec<SyncConfig>, StoreError> {
        let db_path = self.db_path(drive);
        let slots = self.io.get_slots_in_order(&db_path);
        if slots.is_empty() {
            return Err(StoreError::NoDatabase(db_path));
        }

        for slot in slots {
            match self.io.read(&db_path, slot) {
                Ok(mut configs) => {
                    debug!(
                        drive = %drive.display(),
                        slot,
                        configs = configs.len(),
                        "config database read"
                    );
                    if !drive.as_os_str().is_empty() {
                        for config in &mut configs {
                            config.external_drive = Some(drive.to_path_buf());
                        }
                    }
                    self.drives.insert(
                        drive.to_path_buf(),
                        DriveInfo {
                            db_path,
                            slot,
                            dirty: false,
                        },
                    );
                    return Ok(configs);
                }
                Err(err) => {
                    warn!(
                        drive = %drive.display(),
                        slot,
                        error = %err,
                        "config slot unreadable, trying next"
                    );
                }
            }
        }

        Err(StoreError::ReadFailure(self.db_path(drive)))
    }

    /// Writes a drive's configs to the next slot, then unlinks older slots.
    ///
    /// The previous slot is only removed after the new one is written and
    /// fsync'd, so an interrupted write falls back to the old slot on read.
    pub fn write(&mut self, drive: &Path, configs: &[SyncConfig]) -> Result<(), StoreError> {
        let db_path = self.db_path(drive);
        let current = self.drives.get(drive).map(|d| d.slot);
        let next_slot = current.map_or(0, |s| (s + 1) % MAX_SLOTS);

        self.io.write(&db_path, configs, next_slot)?;
        // Verify the new slot before discarding the fallbacks.
        self.io.read(&db_path, next_slot)?;

        for slot in 0..MAX_SLOTS {
            if slot != next_slot {
                if let Err(err) = self.io.remove(&db_path, slot) {
                    warn!(slot, error = %err, "could not remove stale config slot");
                }
            }
        }

        self.drives.insert(
            drive.to_path_buf(),
            DriveInfo {
                db_path,
                slot: next_slot,
                dirty: false,
            },
        );
        Ok(())
    }

    /// Flushes every dirty drive. Returns the drives actually written; dirty
    /// flags are cleared only for those.
    pub fn write_dirty_drives(&mut self, configs: &[SyncConfig]) -> Vec<PathBuf> {
        let dirty: Vec<PathBuf> = self
            .drives
            .iter()
            .filter(|(_, info)| info.dirty)
            .map(|(path, _)| path.clone())
            .collect();

        let mut written = Vec::new();
        for drive in dirty {
            let for_drive: Vec<SyncConfig> = configs
                .iter()
                .filter(|c| {
                    c.external_drive.as_deref().unwrap_or(Path::new("")) == drive.as_path()
                })
                .cloned()
                .collect();

            match self.write(&drive, &for_drive) {
                Ok(()) => written.push(drive),
                Err(err) => {
                    warn!(drive = %drive.display(), error = %err, "dirty drive flush failed");
                    // Leave the dirty flag set for the next attempt.
                    if let Some(info) = self.drives.get_mut(&drive) {
                        info.dirty = true;
                    }
                }
            }
        }
        written
    }

    /// Forgets a drive and removes its database files.
    pub fn remove_drive(&mut self, drive: &Path) -> Result<(), StoreError> {
        let Some(info) = self.drives.remove(drive) else {
            return Err(StoreError::NoDatabase(self.db_path(drive)));
        };
        info!(drive = %drive.display(), "removing config database");
        self.io.remove_all(&info.db_path)
    }

    /// Forgets a drive without touching its files (drive close).
    pub fn forget_drive(&mut self, drive: &Path) -> bool {
        self.drives.remove(drive).is_some()
    }
}
