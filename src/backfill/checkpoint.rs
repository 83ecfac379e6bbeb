use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::util::time::normalize_epoch_to_ms;

/// Last processed position of the in-progress symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub symbol: String,
    /// Next `startTime` to request (ms). `None` restarts the symbol at the window start.
    pub timestamp: Option<i64>,
}

/// On-disk form: `{"symbol": "BTCUSDT", "timestamp": 1700000000000}`.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointRecord {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Single-slot cursor store; each save replaces the previous record.
pub trait CheckpointStore: Send {
    fn load(&self) -> anyhow::Result<Option<Checkpoint>>;
    fn save(&mut self, symbol: &str, timestamp: i64) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> anyhow::Result<Option<Checkpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read checkpoint {}", self.path.display()))?;
        if raw.trim().is_empty() {
            anyhow::bail!("checkpoint {} is empty", self.path.display());
        }
        let record: CheckpointRecord = serde_json::from_str(&raw)
            .with_context(|| format!("parse checkpoint {}", self.path.display()))?;
        let Some(symbol) = record.symbol.filter(|s| !s.trim().is_empty()) else {
            return Ok(None);
        };
        Ok(Some(Checkpoint {
            symbol: symbol.trim().to_ascii_uppercase(),
            timestamp: record.timestamp.map(normalize_epoch_to_ms),
        }))
    }

    fn save(&mut self, symbol: &str, timestamp: i64) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create checkpoint dir {}", parent.display()))?;
        }
        let record = CheckpointRecord {
            symbol: Some(symbol.to_string()),
            timestamp: Some(timestamp),
        };
        let body = serde_json::to_vec(&record).context("serialize checkpoint")?;
        let tmp = self.tmp_path();
        {
            let mut file =
                File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
            file.write_all(&body)
                .with_context(|| format!("write {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("sync {}", tmp.display()))?;
        }
        fs::rename(&tmp, &self.path).with_context(|| {
            format!("rename {} -> {}", tmp.display(), self.path.display())
        })?;
        Ok(())
    }
}
