//! File fingerprints
//!
//! A fingerprint is `(size, mtime, sparse content digest)`. Content equality
//! deliberately ignores mtime: a `touch`ed file must not re-upload, while the
//! mtime still participates in conflict resolution (newer side wins).
//!
//! The digest hashes up to four 4 KiB windows spread through the file rather
//! than the whole content, so fingerprinting stays cheap for large files.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Size of one sampled content window.
const WINDOW_LEN: u64 = 4096;

/// Number of windows sampled from files larger than `WINDOW_LEN * WINDOW_COUNT`.
const WINDOW_COUNT: u64 = 4;

/// Identity of one version of a file's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// File size in bytes.
    pub size: u64,
    /// Last modification time as observed locally or reported by the cloud.
    pub mtime: DateTime<Utc>,
    /// Digest over the sampled content windows.
    pub digest: u64,
}

impl FileFingerprint {
    #[must_use]
    pub fn new(size: u64, mtime: DateTime<Utc>, digest: u64) -> Self {
        Self {
            size,
            mtime,
            digest,
        }
    }

    /// Content equivalence: size and digest, mtime excluded.
    #[must_use]
    pub fn content_eq(&self, other: &FileFingerprint) -> bool {
        self.size == other.size && self.digest == other.digest
    }

    /// Computes the fingerprint of a file on disk.
    ///
    /// Small files (below the total window budget) are digested whole;
    /// larger files contribute four windows spread evenly from start to end.
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let meta = file.metadata()?;
        let size = meta.len();
        let mtime: DateTime<Utc> = meta.modified()?.into();

        let mut hasher = Sha256::new();
        if size <= WINDOW_LEN * WINDOW_COUNT {
            let mut buf = Vec::with_capacity(size as usize);
            file.read_to_end(&mut buf)?;
            hasher.update(&buf);
        } else {
            let mut buf = vec![0u8; WINDOW_LEN as usize];
            let span = size - WINDOW_LEN;
            for i in 0..WINDOW_COUNT {
                let offset = span * i / (WINDOW_COUNT - 1);
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut buf)?;
                hasher.update(&buf);
            }
        }

        let out = hasher.finalize();
        let digest = u64::from_be_bytes(out[..8].try_into().expect("digest is 32 bytes"));

        Ok(Self {
            size,
            mtime,
            digest,
        })
    }
}
