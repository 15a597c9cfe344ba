use anyhow::Context as _;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Persisted per-camera autolaunch policy.
///
/// The whole map is rewritten on every change: the file stays a single small
/// JSON object that is trivially inspectable and crash-consistent via
/// tmp+rename. If a write fails the error surfaces to the caller of that
/// operation only; the in-memory map remains authoritative for this process
/// lifetime.
#[derive(Debug)]
pub struct AutolaunchStore {
    path: PathBuf,
    default_enabled: bool,
    entries: BTreeMap<String, bool>,
}

impl AutolaunchStore {
    pub fn load(path: &Path, default_enabled: bool) -> anyhow::Result<Self> {
        let entries = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str::<BTreeMap<String, bool>>(&raw)
                .with_context(|| format!("parse autolaunch policy {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("read autolaunch policy {}", path.display()))
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            default_enabled,
            entries,
        })
    }

    /// Stored decision, or the environment default when no entry exists.
    pub fn get(&self, camera: &str) -> bool {
        self.entries
            .get(camera)
            .copied()
            .unwrap_or(self.default_enabled)
    }

    pub fn set(&mut self, camera: &str, enabled: bool) -> anyhow::Result<()> {
        self.entries.insert(camera.to_string(), enabled);
        self.persist()
    }

    /// Drops entries for cameras absent from `existing`, then persists.
    /// Idempotent; never fabricates entries for cameras lacking an explicit
    /// decision (absence still defaults via `get`).
    pub fn prune(&mut self, existing: &[String]) -> anyhow::Result<()> {
        self.entries.retain(|name, _| existing.iter().any(|c| c == name));
        self.persist()
    }

    pub fn has_entry(&self, camera: &str) -> bool {
        self.entries.contains_key(camera)
    }

    fn persist(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create policy dir {}", parent.display()))?;
            }
        }
        let bytes = serde_json::to_vec_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("write autolaunch policy {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename autolaunch policy into {}", self.path.display()))?;
        Ok(())
    }
}
