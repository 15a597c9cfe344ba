use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Interpreter used to launch worker processes.
    #[serde(default = "default_interpreter")]
    pub interpreter: PathBuf,

    /// Worker script path. Its file name is also the substring used by the
    /// cross-process liveness check against `/proc/<pid>/cmdline`.
    pub worker_script: PathBuf,

    /// Optional installation/location identifier, passed to every worker as
    /// `--location <loc>`.
    #[serde(default)]
    pub location: Option<String>,

    /// Camera names managed by this supervisor. One worker process per name.
    pub cameras: Vec<String>,

    /// Directory for worker state record files (`<camera>.state.json`).
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,

    /// Base directory for per-camera worker stdout/stderr logs.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Persisted autolaunch policy file (single JSON object, camera -> bool).
    #[serde(default = "default_autolaunch_file")]
    pub autolaunch_file: PathBuf,

    /// Autolaunch decision for cameras with no explicit policy entry.
    #[serde(default)]
    pub autolaunch_default: bool,

    #[serde(default = "default_watchdog_period_ms")]
    pub watchdog_period_ms: u64,
    #[serde(default = "default_watchdog_jitter_ms")]
    pub watchdog_jitter_ms: u64,

    /// Grace window after SIGTERM before a worker is force-killed.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Post-launch settle delay for interactively triggered starts.
    #[serde(default = "default_start_delay_ms")]
    pub start_delay_ms: u64,
    /// Post-launch settle delay for watchdog-triggered starts (nothing waits
    /// synchronously on these, so it can be longer).
    #[serde(default = "default_watchdog_start_delay_ms")]
    pub watchdog_start_delay_ms: u64,

    /// Control socket for the local RPC surface.
    #[serde(default = "default_sock")]
    pub sock: PathBuf,
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkerConfigFile {
    #[serde(default = "default_interpreter")]
    interpreter: PathBuf,
    script: PathBuf,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathsConfigFile {
    #[serde(default)]
    run_dir: Option<PathBuf>,
    #[serde(default)]
    log_dir: Option<PathBuf>,
    #[serde(default)]
    autolaunch_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyConfigFile {
    #[serde(default)]
    autolaunch_default: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct WatchdogConfigFile {
    #[serde(default = "default_watchdog_period_ms")]
    period_ms: u64,
    #[serde(default = "default_watchdog_jitter_ms")]
    jitter_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimeoutsConfigFile {
    #[serde(default = "default_stop_grace_ms")]
    stop_grace_ms: u64,
    #[serde(default = "default_start_delay_ms")]
    start_delay_ms: u64,
    #[serde(default = "default_watchdog_start_delay_ms")]
    watchdog_start_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ControlConfigFile {
    #[serde(default = "default_sock")]
    sock: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SupervisorConfigFile {
    worker: WorkerConfigFile,
    cameras: Vec<String>,
    #[serde(default)]
    paths: Option<PathsConfigFile>,
    #[serde(default)]
    policy: Option<PolicyConfigFile>,
    #[serde(default)]
    watchdog: Option<WatchdogConfigFile>,
    #[serde(default)]
    timeouts: Option<TimeoutsConfigFile>,
    #[serde(default)]
    control: Option<ControlConfigFile>,
}

fn default_interpreter() -> PathBuf {
    "/usr/bin/python3".into()
}
fn default_run_dir() -> PathBuf {
    "run".into()
}
fn default_log_dir() -> PathBuf {
    "logs".into()
}
fn default_autolaunch_file() -> PathBuf {
    "autolaunch.json".into()
}
fn default_watchdog_period_ms() -> u64 {
    30_000
}
fn default_watchdog_jitter_ms() -> u64 {
    5_000
}
fn default_stop_grace_ms() -> u64 {
    10_000
}
fn default_start_delay_ms() -> u64 {
    3_000
}
fn default_watchdog_start_delay_ms() -> u64 {
    8_000
}
fn default_sock() -> PathBuf {
    "/tmp/cammaster.sock".into()
}

/// Camera names become map keys, file names, and command-line arguments, so
/// the accepted alphabet is deliberately narrow.
pub fn validate_camera_name(name: &str) -> anyhow::Result<()> {
    anyhow::ensure!(!name.is_empty(), "camera name must not be empty");
    anyhow::ensure!(
        name.trim() == name,
        "camera name must not have leading/trailing whitespace: {name:?}"
    );
    anyhow::ensure!(
        name.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')),
        "camera name may only contain [A-Za-z0-9._-]: {name:?}"
    );
    anyhow::ensure!(
        !name.starts_with('.'),
        "camera name must not start with a dot: {name:?}"
    );
    Ok(())
}

pub fn load_config(config_path: &Path) -> anyhow::Result<SupervisorConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    let file_cfg: SupervisorConfigFile = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?;

    // Start from defaults and overlay provided groups.
    let mut cfg = SupervisorConfig {
        interpreter: file_cfg.worker.interpreter,
        worker_script: file_cfg.worker.script,
        location: file_cfg.worker.location,
        cameras: file_cfg.cameras,
        run_dir: default_run_dir(),
        log_dir: default_log_dir(),
        autolaunch_file: default_autolaunch_file(),
        autolaunch_default: false,
        watchdog_period_ms: default_watchdog_period_ms(),
        watchdog_jitter_ms: default_watchdog_jitter_ms(),
        stop_grace_ms: default_stop_grace_ms(),
        start_delay_ms: default_start_delay_ms(),
        watchdog_start_delay_ms: default_watchdog_start_delay_ms(),
        sock: default_sock(),
    };

    if let Some(p) = file_cfg.paths {
        if let Some(v) = p.run_dir {
            cfg.run_dir = v;
        }
        if let Some(v) = p.log_dir {
            cfg.log_dir = v;
        }
        if let Some(v) = p.autolaunch_file {
            cfg.autolaunch_file = v;
        }
    }
    if let Some(p) = file_cfg.policy {
        cfg.autolaunch_default = p.autolaunch_default;
    }
    if let Some(w) = file_cfg.watchdog {
        cfg.watchdog_period_ms = w.period_ms;
        cfg.watchdog_jitter_ms = w.jitter_ms;
    }
    if let Some(t) = file_cfg.timeouts {
        cfg.stop_grace_ms = t.stop_grace_ms;
        cfg.start_delay_ms = t.start_delay_ms;
        cfg.watchdog_start_delay_ms = t.watchdog_start_delay_ms;
    }
    if let Some(c) = file_cfg.control {
        cfg.sock = c.sock;
    }

    anyhow::ensure!(
        cfg.worker_script.file_name().is_some(),
        "worker.script must name a file: {:?}",
        cfg.worker_script
    );
    anyhow::ensure!(!cfg.cameras.is_empty(), "cameras list must not be empty");
    anyhow::ensure!(cfg.watchdog_period_ms > 0, "watchdog.period_ms must be > 0");
    if let Some(loc) = cfg.location.as_deref() {
        anyhow::ensure!(!loc.trim().is_empty(), "worker.location must not be empty if provided");
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for name in &cfg.cameras {
        validate_camera_name(name)?;
        anyhow::ensure!(seen.insert(name.as_str()), "duplicate camera name: {name:?}");
    }

    // Resolve relative paths against the config file directory.
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    if cfg.worker_script.is_relative() {
        cfg.worker_script = base.join(&cfg.worker_script);
    }
    if cfg.run_dir.is_relative() {
        cfg.run_dir = base.join(&cfg.run_dir);
    }
    if cfg.log_dir.is_relative() {
        cfg.log_dir = base.join(&cfg.log_dir);
    }
    if cfg.autolaunch_file.is_relative() {
        cfg.autolaunch_file = base.join(&cfg.autolaunch_file);
    }
    if cfg.sock.is_relative() {
        cfg.sock = base.join(&cfg.sock);
    }

    Ok(cfg)
}

impl SupervisorConfig {
    /// File-name component of the worker script, used for the cmdline
    /// substring match in the liveness check.
    pub fn worker_script_name(&self) -> String {
        self.worker_script
            .file_name()
            .map(|os| os.to_string_lossy().to_string())
            .unwrap_or_else(|| self.worker_script.display().to_string())
    }

    pub fn has_camera(&self, name: &str) -> bool {
        self.cameras.iter().any(|c| c == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("cammaster.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "worker:\n  script: worker.py\ncameras:\n  - cam-entrance\n  - cam-dock\n",
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.interpreter, PathBuf::from("/usr/bin/python3"));
        assert_eq!(cfg.cameras, vec!["cam-entrance", "cam-dock"]);
        assert_eq!(cfg.watchdog_period_ms, 30_000);
        assert_eq!(cfg.stop_grace_ms, 10_000);
        assert!(!cfg.autolaunch_default);
        // Relative paths resolve against the config directory.
        assert_eq!(cfg.run_dir, dir.path().join("run"));
        assert_eq!(cfg.worker_script, dir.path().join("worker.py"));
        assert_eq!(cfg.worker_script_name(), "worker.py");
    }

    #[test]
    fn grouped_sections_overlay_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "worker:\n  interpreter: /usr/bin/python3.11\n  script: /opt/cam/worker.py\n  location: hall-a\n\
             cameras:\n  - gate\npaths:\n  run_dir: /var/run/cammaster\npolicy:\n  autolaunch_default: true\n\
             watchdog:\n  period_ms: 15000\n  jitter_ms: 2000\ntimeouts:\n  stop_grace_ms: 4000\n  start_delay_ms: 0\n  watchdog_start_delay_ms: 0\n",
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.location.as_deref(), Some("hall-a"));
        assert_eq!(cfg.run_dir, PathBuf::from("/var/run/cammaster"));
        assert!(cfg.autolaunch_default);
        assert_eq!(cfg.watchdog_period_ms, 15_000);
        assert_eq!(cfg.stop_grace_ms, 4_000);
        assert_eq!(cfg.start_delay_ms, 0);
    }

    #[test]
    fn rejects_duplicate_and_invalid_camera_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "worker:\n  script: worker.py\ncameras:\n  - gate\n  - gate\n",
        );
        assert!(load_config(&path).is_err());

        assert!(validate_camera_name("cam-1").is_ok());
        assert!(validate_camera_name("a/b").is_err());
        assert!(validate_camera_name("").is_err());
        assert!(validate_camera_name(" cam").is_err());
        assert!(validate_camera_name(".hidden").is_err());
    }

    #[test]
    fn rejects_empty_camera_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "worker:\n  script: worker.py\ncameras: []\n");
        assert!(load_config(&path).is_err());
    }
}
