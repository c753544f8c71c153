use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, RunnerError};

/// Name used by `/save` and `/load` when no name is given.
pub const DEFAULT_STATE_NAME: &str = "kv";
/// Name used by `/save_set` and `/load_set` when no name is given.
pub const DEFAULT_SETTINGS_NAME: &str = "set";

const STATE_SUFFIX: &str = ".state";
const SETTINGS_SUFFIX: &str = ".set.json";
const MAX_NAME_LEN: usize = 200;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    State,
    Settings,
}

impl BlobKind {
    fn suffix(&self) -> &'static str {
        match self {
            BlobKind::State => STATE_SUFFIX,
            BlobKind::Settings => SETTINGS_SUFFIX,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub name: String,
    pub state_size: Option<u64>,
    pub settings_size: Option<u64>,
}

/// Directory of named checkpoints.
///
/// Each name owns at most one model-state file (`<name>.state`) and one
/// sampling-settings file (`<name>.set.json`). Writes go to a hidden
/// temporary file in the same directory and are renamed over the target,
/// so readers only ever see a complete previous or complete new blob.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn validate_name(name: &str) -> Result<()> {
        let bad = name.is_empty()
            || name.len() > MAX_NAME_LEN
            || name.starts_with('.')
            || name
                .chars()
                .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_whitespace() || c.is_control());

        if bad {
            return Err(RunnerError::InvalidCheckpointName(name.to_string()));
        }
        Ok(())
    }

    fn path(&self, name: &str, kind: BlobKind) -> PathBuf {
        self.root.join(format!("{}{}", name, kind.suffix()))
    }

    pub fn contains(&self, name: &str, kind: BlobKind) -> bool {
        Self::validate_name(name).is_ok() && self.path(name, kind).is_file()
    }

    pub fn save(&self, name: &str, kind: BlobKind, blob: &[u8]) -> Result<u64> {
        Self::validate_name(name)?;
        let target = self.path(name, kind);
        let written = self.write_atomic(&target, blob).map_err(|source| RunnerError::CheckpointWrite {
            name: name.to_string(),
            source,
        })?;

        tracing::info!("saved {:?} checkpoint {} ({} bytes)", kind, name, written);
        Ok(written)
    }

    pub fn load(&self, name: &str, kind: BlobKind) -> Result<Vec<u8>> {
        Self::validate_name(name)?;
        match fs::read(self.path(name, kind)) {
            Ok(blob) => {
                tracing::info!("loaded {:?} checkpoint {} ({} bytes)", kind, name, blob.len());
                Ok(blob)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(RunnerError::CheckpointNotFound(name.to_string())),
            Err(e) => Err(RunnerError::CheckpointRead {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    pub fn save_state(&self, name: &str, blob: &[u8]) -> Result<u64> {
        self.save(name, BlobKind::State, blob)
    }

    pub fn load_state(&self, name: &str) -> Result<Vec<u8>> {
        self.load(name, BlobKind::State)
    }

    pub fn save_settings(&self, name: &str, blob: &[u8]) -> Result<u64> {
        self.save(name, BlobKind::Settings, blob)
    }

    pub fn load_settings(&self, name: &str) -> Result<Vec<u8>> {
        self.load(name, BlobKind::Settings)
    }

    /// Every checkpoint name in the store, sorted. Temporary files are skipped.
    pub fn list(&self) -> Result<Vec<CheckpointEntry>> {
        let mut entries: BTreeMap<String, CheckpointEntry> = BTreeMap::new();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);

            if let Some(name) = file_name.strip_suffix(SETTINGS_SUFFIX) {
                let e = entries.entry(name.to_string()).or_default();
                e.name = name.to_string();
                e.settings_size = Some(size);
            } else if let Some(name) = file_name.strip_suffix(STATE_SUFFIX) {
                let e = entries.entry(name.to_string()).or_default();
                e.name = name.to_string();
                e.state_size = Some(size);
            }
        }

        Ok(entries.into_values().collect())
    }

    fn write_atomic(&self, target: &Path, blob: &[u8]) -> std::io::Result<u64> {
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("checkpoint");
        let tmp = self.root.join(format!(
            ".{}.tmp.{}.{}",
            file_name,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let result = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(blob)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp, target)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        Ok(blob.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();

        assert_eq!(store.save_state("blank", b"abc").unwrap(), 3);
        assert_eq!(store.load_state("blank").unwrap(), b"abc");
        assert!(store.contains("blank", BlobKind::State));
        assert!(!store.contains("blank", BlobKind::Settings));

        store.save_state("blank", b"overwritten").unwrap();
        assert_eq!(store.load_state("blank").unwrap(), b"overwritten");
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();

        match store.load_state("missing") {
            Err(RunnerError::CheckpointNotFound(name)) => assert_eq!(name, "missing"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unsafe_names() {
        for name in ["", "../etc", "a/b", ".hidden", "two words", "nul\0"] {
            assert!(CheckpointStore::validate_name(name).is_err(), "{:?}", name);
        }
        assert!(CheckpointStore::validate_name("session-1.v2").is_ok());
    }

    #[test]
    fn test_list_groups_state_and_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();

        store.save_state("blank", b"s").unwrap();
        store.save_settings("coder", b"{}").unwrap();
        store.save_state("coder", b"xy").unwrap();
        fs::write(dir.path().join(".kv.state.tmp.1.0"), b"partial").unwrap();

        let names: Vec<_> = store.list().unwrap().into_iter().map(|e| (e.name, e.state_size, e.settings_size)).collect();
        assert_eq!(
            names,
            vec![
                ("blank".to_string(), Some(1), None),
                ("coder".to_string(), Some(2), Some(2)),
            ]
        );
    }

    #[test]
    fn test_failed_write_keeps_previous_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        store.save_state("keep", b"original").unwrap();

        // A directory squatting on the target makes the rename fail.
        let blocked = CheckpointStore::open(dir.path().join("sub")).unwrap();
        fs::create_dir(blocked.root().join("keep.state")).unwrap();
        assert!(matches!(
            blocked.save_state("keep", b"new"),
            Err(RunnerError::CheckpointWrite { .. })
        ));

        assert_eq!(store.load_state("keep").unwrap(), b"original");
        let leftovers = fs::read_dir(blocked.root()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
