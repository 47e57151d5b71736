//! Persisted counter snapshot
//!
//! The on-disk form is a single JSON object:
//!
//! ```json
//! {"total": 42, "daily": {"2024-01-01": 40, "2024-01-02": 2}}
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Requests counted over the whole lifetime of the snapshot file
    #[serde(default)]
    pub total: u64,

    /// Requests counted per local calendar day, keyed by `YYYY-MM-DD`
    #[serde(default, deserialize_with = "deserialize_daily")]
    pub daily: BTreeMap<String, u64>,
}

/// `"daily": null` loads as an empty mapping.
fn deserialize_daily<'de, D>(deserializer: D) -> Result<BTreeMap<String, u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, u64>>::deserialize(deserializer)?.unwrap_or_default())
}

impl StatsSnapshot {
    /// Parse a snapshot from JSON bytes
    pub fn from_json(data: &[u8]) -> Result<Self, SnapshotError> {
        serde_json::from_slice(data).map_err(SnapshotError::Decode)
    }

    /// Encode the snapshot as compact JSON
    pub fn to_json(&self) -> Result<Vec<u8>, SnapshotError> {
        serde_json::to_vec(self).map_err(SnapshotError::Encode)
    }

    /// Read a snapshot file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SnapshotError> {
        let data = fs::read(path.as_ref())?;
        Self::from_json(&data)
    }

    /// Write the snapshot atomically
    ///
    /// Data goes to a sibling `.tmp` file which is synced and then renamed
    /// over `path`, so readers only ever see a complete snapshot.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SnapshotError> {
        let path = path.as_ref();
        let data = self.to_json()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = path.with_extension("tmp");
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        writer.write_all(&data)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

/// Snapshot error types
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(serde_json::Error),

    #[error("Encode error: {0}")]
    Encode(serde_json::Error),
}
