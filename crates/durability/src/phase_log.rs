//! On-disk phase files
//!
//! Each persistent store keeps one file per committed phase still inside
//! its recovery window:
//!
//! ```text
//! <dir>/<store>.<phase:020>.phase       published phase
//! <dir>/<store>.<phase:020>.phase.tmp   prepared, not yet published
//! ```
//!
//! File layout (little endian):
//!
//! ```text
//! magic "QPH1" | phase u64 | payload length u32 | crc32 u32 | payload (JSON)
//! ```
//!
//! `prepare` writes the temp file and fsyncs it; `commit` renames it into
//! place, which is the atomic phase flip. Files failing validation are
//! left out of the recovery set.

use quarry_core::{Phase, QuarryError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes at the start of every phase file
pub const PHASE_FILE_MAGIC: &[u8; 4] = b"QPH1";

/// Size of the fixed header preceding the payload
pub const PHASE_HEADER_SIZE: usize = 4 + 8 + 4 + 4;

const PHASE_EXT: &str = "phase";
const TEMP_EXT: &str = "phase.tmp";

/// Validation failures for a phase file
#[derive(Debug, thiserror::Error)]
pub enum PhaseFileError {
    /// File shorter than its header or declared payload
    #[error("phase file truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required
        expected: usize,
        /// Bytes present
        actual: usize,
    },

    /// Magic bytes do not match
    #[error("invalid phase file magic")]
    InvalidMagic,

    /// Header names a different phase than the file name
    #[error("phase mismatch: header says {found}, file name says {expected}")]
    PhaseMismatch {
        /// Phase from the file name
        expected: u64,
        /// Phase from the header
        found: u64,
    },

    /// Payload checksum does not match
    #[error("phase file checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// CRC stored in the header
        stored: u32,
        /// CRC of the payload on disk
        computed: u32,
    },
}

impl From<PhaseFileError> for QuarryError {
    fn from(e: PhaseFileError) -> Self {
        QuarryError::resource("phase-log", e.to_string())
    }
}

/// Directory of phase files for one store
#[derive(Debug, Clone)]
pub struct PhaseLog {
    dir: PathBuf,
    name: String,
    sync: bool,
}

impl PhaseLog {
    /// Open (creating if needed) the phase directory for `name`
    pub fn open(dir: impl Into<PathBuf>, name: &str, sync: bool) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(PhaseLog {
            dir,
            name: name.to_string(),
            sync,
        })
    }

    /// Directory holding the phase files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the published file for `phase`
    pub fn phase_path(&self, phase: Phase) -> PathBuf {
        self.dir
            .join(format!("{}.{:020}.{}", self.name, phase.0, PHASE_EXT))
    }

    fn temp_path(&self, phase: Phase) -> PathBuf {
        self.dir
            .join(format!("{}.{:020}.{}", self.name, phase.0, TEMP_EXT))
    }

    /// Write `state` as the prepared (unpublished) file for `phase`
    pub fn write_prepared<S: Serialize>(&self, phase: Phase, state: &S) -> Result<()> {
        let payload = serde_json::to_vec(state)?;
        self.write_prepared_bytes(phase, &payload)
    }

    /// Write an already-serialized payload as the prepared file for `phase`
    pub fn write_prepared_bytes(&self, phase: Phase, payload: &[u8]) -> Result<()> {
        let bytes = encode(phase, payload)?;
        let path = self.temp_path(phase);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&bytes)?;
        if self.sync {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Atomically publish the prepared file for `phase`
    pub fn publish(&self, phase: Phase) -> Result<()> {
        let temp = self.temp_path(phase);
        if !temp.exists() {
            return Err(QuarryError::resource(
                self.name.clone(),
                format!("no prepared file for {}", phase),
            ));
        }
        fs::rename(&temp, self.phase_path(phase))?;
        if self.sync {
            self.sync_dir()?;
        }
        Ok(())
    }

    /// Remove the prepared file for `phase`, if any
    pub fn discard(&self, phase: Phase) -> Result<()> {
        match fs::remove_file(self.temp_path(phase)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Published phases whose files validate
    pub fn phases(&self) -> Result<BTreeSet<Phase>> {
        let mut valid = BTreeSet::new();
        for phase in self.published()? {
            match self.read_payload(phase) {
                Ok(_) => {
                    valid.insert(phase);
                }
                Err(e) => {
                    warn!(
                        target: "quarry::phase",
                        store = %self.name,
                        phase = phase.0,
                        error = %e,
                        "Ignoring unreadable phase file"
                    );
                }
            }
        }
        Ok(valid)
    }

    /// Load and decode the state stored for `phase`
    pub fn load<S: DeserializeOwned>(&self, phase: Phase) -> Result<S> {
        let payload = self.read_payload(phase)?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Delete every phase file (published or prepared) newer than `phase`
    pub fn remove_after(&self, phase: Phase) -> Result<()> {
        for (file_phase, path) in self.entries()? {
            if file_phase > phase {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Keep only the newest `keep` published phases
    pub fn prune(&self, keep: usize) -> Result<()> {
        let published = self.published()?;
        let excess = published.len().saturating_sub(keep);
        for phase in published.into_iter().take(excess) {
            fs::remove_file(self.phase_path(phase))?;
        }
        Ok(())
    }

    /// Delete every phase file of this store
    pub fn clear(&self) -> Result<()> {
        for (_, path) in self.entries()? {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn read_payload(&self, phase: Phase) -> Result<Vec<u8>> {
        let data = fs::read(self.phase_path(phase))?;
        Ok(decode(phase, &data)?.to_vec())
    }

    fn published(&self) -> Result<BTreeSet<Phase>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|(_, path)| {
                path.extension().and_then(|e| e.to_str()) == Some(PHASE_EXT)
            })
            .map(|(phase, _)| phase)
            .collect())
    }

    fn entries(&self) -> Result<Vec<(Phase, PathBuf)>> {
        let prefix = format!("{}.", self.name);
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(rest) = file_name.strip_prefix(&prefix) else {
                continue;
            };
            let digits = rest
                .strip_suffix(&format!(".{}", TEMP_EXT))
                .or_else(|| rest.strip_suffix(&format!(".{}", PHASE_EXT)));
            if let Some(phase) = digits.and_then(|d| d.parse::<u64>().ok()) {
                entries.push((Phase(phase), path));
            }
        }
        Ok(entries)
    }

    fn sync_dir(&self) -> Result<()> {
        // Directory fsync is not supported everywhere; a failure to open is not fatal.
        if let Ok(dir) = File::open(&self.dir) {
            dir.sync_all()?;
        }
        Ok(())
    }
}

fn encode(phase: Phase, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| QuarryError::Serialization("phase payload exceeds 4 GiB".into()))?;
    let mut buf = Vec::with_capacity(PHASE_HEADER_SIZE + payload.len());
    buf.extend_from_slice(PHASE_FILE_MAGIC);
    buf.extend_from_slice(&phase.0.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn decode(expected: Phase, data: &[u8]) -> std::result::Result<&[u8], PhaseFileError> {
    if data.len() < PHASE_HEADER_SIZE {
        return Err(PhaseFileError::Truncated {
            expected: PHASE_HEADER_SIZE,
            actual: data.len(),
        });
    }
    if &data[0..4] != PHASE_FILE_MAGIC {
        return Err(PhaseFileError::InvalidMagic);
    }
    let mut phase = [0u8; 8];
    phase.copy_from_slice(&data[4..12]);
    let phase = u64::from_le_bytes(phase);
    if phase != expected.0 {
        return Err(PhaseFileError::PhaseMismatch {
            expected: expected.0,
            found: phase,
        });
    }
    let mut word = [0u8; 4];
    word.copy_from_slice(&data[12..16]);
    let len = u32::from_le_bytes(word) as usize;
    word.copy_from_slice(&data[16..20]);
    let stored = u32::from_le_bytes(word);

    let end = PHASE_HEADER_SIZE + len;
    if data.len() < end {
        return Err(PhaseFileError::Truncated {
            expected: end,
            actual: data.len(),
        });
    }
    let payload = &data[PHASE_HEADER_SIZE..end];
    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(PhaseFileError::ChecksumMismatch { stored, computed });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn open_log(dir: &TempDir) -> PhaseLog {
        PhaseLog::open(dir.path(), "string-pool", false).unwrap()
    }

    #[test]
    fn test_prepared_file_is_not_recoverable_until_published() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.write_prepared(Phase(1), &vec![1u64, 2, 3]).unwrap();
        assert!(log.phases().unwrap().is_empty());

        log.publish(Phase(1)).unwrap();
        assert_eq!(log.phases().unwrap(), BTreeSet::from([Phase(1)]));
        let loaded: Vec<u64> = log.load(Phase(1)).unwrap();
        assert_eq!(loaded, vec![1, 2, 3]);
    }

    #[test]
    fn test_publish_without_prepare_fails() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        assert!(log.publish(Phase(4)).is_err());
    }

    #[test]
    fn test_discard_removes_prepared_file() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        log.write_prepared(Phase(2), &"working").unwrap();
        log.discard(Phase(2)).unwrap();
        assert!(log.publish(Phase(2)).is_err());
        // Discarding twice is harmless
        log.discard(Phase(2)).unwrap();
    }

    #[test]
    fn test_corrupt_file_is_excluded() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        for p in 1..=2 {
            log.write_prepared(Phase(p), &BTreeMap::from([("k", p)])).unwrap();
            log.publish(Phase(p)).unwrap();
        }

        let path = log.phase_path(Phase(2));
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert_eq!(log.phases().unwrap(), BTreeSet::from([Phase(1)]));
        assert!(log.load::<BTreeMap<String, u64>>(Phase(2)).is_err());
    }

    #[test]
    fn test_prune_and_remove_after() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        for p in 1..=5 {
            log.write_prepared(Phase(p), &p).unwrap();
            log.publish(Phase(p)).unwrap();
        }
        log.prune(3).unwrap();
        assert_eq!(
            log.phases().unwrap(),
            BTreeSet::from([Phase(3), Phase(4), Phase(5)])
        );

        log.write_prepared(Phase(6), &6u64).unwrap();
        log.remove_after(Phase(4)).unwrap();
        assert_eq!(log.phases().unwrap(), BTreeSet::from([Phase(3), Phase(4)]));
        assert!(log.publish(Phase(6)).is_err());

        log.clear().unwrap();
        assert!(log.phases().unwrap().is_empty());
    }

    #[test]
    fn test_stores_share_directory_without_collision() {
        let dir = TempDir::new().unwrap();
        let nodes = PhaseLog::open(dir.path(), "node-pool", false).unwrap();
        let strings = PhaseLog::open(dir.path(), "string-pool", false).unwrap();
        nodes.write_prepared(Phase(1), &1u64).unwrap();
        nodes.publish(Phase(1)).unwrap();

        assert_eq!(nodes.phases().unwrap().len(), 1);
        assert!(strings.phases().unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_header() {
        assert!(matches!(
            decode(Phase(1), b"QPH"),
            Err(PhaseFileError::Truncated { .. })
        ));
        let bytes = encode(Phase(1), b"{}").unwrap();
        assert!(matches!(
            decode(Phase(2), &bytes),
            Err(PhaseFileError::PhaseMismatch { .. })
        ));
        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(matches!(
            decode(Phase(1), &bad),
            Err(PhaseFileError::InvalidMagic)
        ));
    }
}
