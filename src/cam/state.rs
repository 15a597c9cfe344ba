use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Status document a worker overwrites on each meaningful state transition.
/// The supervisor only ever reads these; it deletes them at its own startup
/// and after a deliberate stop so a dead worker never shows a stale
/// "running" description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStateRecord {
    pub pid: i32,
    pub script: String,
    #[serde(default)]
    pub standby: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub updated: String,
}

pub fn record_path(run_dir: &Path, camera: &str) -> PathBuf {
    run_dir.join(format!("{camera}.state.json"))
}

/// Absence, unreadable content, or a corrupt document all read as "no state
/// available"; the caller synthesizes an offline status instead of failing.
pub fn load_record(run_dir: &Path, camera: &str) -> Option<WorkerStateRecord> {
    let raw = std::fs::read_to_string(record_path(run_dir, camera)).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Best-effort removal; a record that is already gone is fine.
pub fn remove_record(run_dir: &Path, camera: &str) {
    let path = record_path(run_dir, camera);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            crate::cam::daemon::cam_event(
                "state",
                Some(camera),
                format!("remove_record outcome=error path={} err={e}", path.display()),
            );
        }
    }
}

/// Deletes every state record under `run_dir`. Run once at supervisor
/// construction so an unclean previous shutdown cannot leave stale state.
pub fn clear_all_records(run_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(run_dir)
        .map_err(|e| anyhow::anyhow!("create run dir {}: {e}", run_dir.display()))?;
    let mut removed = 0usize;
    for entry in std::fs::read_dir(run_dir)
        .map_err(|e| anyhow::anyhow!("read run dir {}: {e}", run_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".state.json") && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        crate::cam::daemon::cam_event("state", None, format!("stale_records_cleared count={removed}"));
    }
    Ok(())
}

pub fn now_stamp() -> String {
    Local::now().format("%Y-%m-%d_%H:%M:%S%.3f").to_string()
}

/// Status payload shared by the "derived from a worker state record" and the
/// "synthesized offline" paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraStatus {
    pub is_running: bool,
    pub in_standby: bool,
    pub autolaunch_enabled: bool,
    pub description: String,
    pub timestamp: String,
}

impl CameraStatus {
    /// Synthesized status for a camera with no live worker. The description
    /// distinguishes "we will bring it back" from "it is deliberately off".
    pub fn offline(autolaunch_enabled: bool) -> Self {
        Self {
            is_running: false,
            in_standby: false,
            autolaunch_enabled,
            description: if autolaunch_enabled {
                "reconnecting".to_string()
            } else {
                "offline".to_string()
            },
            timestamp: now_stamp(),
        }
    }

    /// Status for a live worker that has not written its first record yet.
    pub fn starting(autolaunch_enabled: bool) -> Self {
        Self {
            is_running: true,
            in_standby: false,
            autolaunch_enabled,
            description: "starting".to_string(),
            timestamp: now_stamp(),
        }
    }

    pub fn from_record(rec: &WorkerStateRecord, autolaunch_enabled: bool) -> Self {
        Self {
            is_running: true,
            in_standby: rec.standby,
            autolaunch_enabled,
            description: rec.status.clone(),
            timestamp: rec.updated.clone(),
        }
    }
}
