use crate::cam::config::SupervisorConfig;
use crate::cam::daemon::cam_event;
use crate::cam::launcher::{ProcessHandle, Spawner};
use crate::cam::liveness;
use crate::cam::policy::AutolaunchStore;
use crate::cam::state::{self, CameraStatus};
use nix::sys::signal::{kill, Signal};
use nix::unistd::getpid;
use rand::Rng as _;
use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Owns the process registry, the autolaunch policy and the watchdog for one
/// camera fleet. Constructed once per host process; all methods are safe to
/// call from concurrent request handlers. Mutating operations serialize on
/// the registry lock; the lock is never held across a post-launch delay or
/// the combined stop_all grace sleep.
pub struct Supervisor {
    cfg: SupervisorConfig,
    registry: Mutex<HashMap<String, Box<dyn ProcessHandle>>>,
    policy: Mutex<AutolaunchStore>,
    spawner: Box<dyn Spawner>,
    watchdog_stop: Mutex<Option<mpsc::Sender<()>>>,
    watchdog_join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Supervisor {
    /// Clears stale worker state records from any unclean previous shutdown,
    /// prunes the autolaunch policy to the configured camera list, and
    /// builds the (initially idle) supervisor. Call `start_watchdog` to arm
    /// relaunching and `shutdown` for teardown.
    pub fn new(cfg: SupervisorConfig, spawner: Box<dyn Spawner>) -> anyhow::Result<Arc<Self>> {
        // Stale records must be gone before any liveness check can read them.
        state::clear_all_records(&cfg.run_dir)?;
        let mut policy = AutolaunchStore::load(&cfg.autolaunch_file, cfg.autolaunch_default)?;
        policy.prune(&cfg.cameras)?;
        Ok(Arc::new(Self {
            cfg,
            registry: Mutex::new(HashMap::new()),
            policy: Mutex::new(policy),
            spawner,
            watchdog_stop: Mutex::new(None),
            watchdog_join: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.cfg
    }

    fn ensure_known(&self, camera: &str) -> anyhow::Result<()> {
        anyhow::ensure!(self.cfg.has_camera(camera), "unknown camera: {camera}");
        Ok(())
    }

    /// Starts the worker for `camera`, stopping any prior instance first
    /// (idempotent restart semantics), then sleeps the interactive
    /// post-launch delay so the worker can reach a stable state before the
    /// caller proceeds.
    pub fn start(&self, camera: &str) -> anyhow::Result<()> {
        self.ensure_known(camera)?;
        self.start_with_delay(camera, self.cfg.start_delay_ms)
    }

    /// Same as `start`; stop-before-start makes restart a plain start.
    pub fn restart(&self, camera: &str) -> anyhow::Result<()> {
        self.start(camera)
    }

    fn start_with_delay(&self, camera: &str, delay_ms: u64) -> anyhow::Result<()> {
        // Single-instance-per-camera: any prior worker goes away first.
        self.stop_internal(camera)?;
        {
            let mut reg = self.registry.lock().unwrap_or_else(|p| p.into_inner());
            // A concurrent start may have won the race between the stop
            // above and this lock; its worker is the prior instance now.
            evict_raced_instance(&mut reg, camera);
            let handle = self.spawner.spawn(&self.cfg, camera)?;
            cam_event(
                "start",
                Some(camera),
                format!("outcome=spawned pid={}", handle.pid()),
            );
            reg.insert(camera.to_string(), handle);
        }
        if delay_ms > 0 {
            thread::sleep(Duration::from_millis(delay_ms));
        }
        Ok(())
    }

    /// Stops the worker for `camera`: graceful SIGTERM, bounded wait, forced
    /// kill on timeout. No-op when nothing is registered. Returns the pid of
    /// the stopped worker for diagnostics.
    pub fn stop(&self, camera: &str) -> anyhow::Result<Option<u32>> {
        self.ensure_known(camera)?;
        self.stop_internal(camera)
    }

    fn stop_internal(&self, camera: &str) -> anyhow::Result<Option<u32>> {
        let handle = {
            let mut reg = self.registry.lock().unwrap_or_else(|p| p.into_inner());
            reg.remove(camera)
        };
        let Some(mut handle) = handle else {
            return Ok(None);
        };
        let pid = handle.pid();
        cam_event("stop", Some(camera), format!("attempt=terminate pid={pid}"));
        if let Err(e) = handle.terminate() {
            cam_event(
                "stop",
                Some(camera),
                format!("terminate outcome=error pid={pid} err={e:#}"),
            );
        }
        let deadline = Instant::now() + Duration::from_millis(self.cfg.stop_grace_ms);
        loop {
            if !handle.is_alive() {
                cam_event("stop", Some(camera), format!("outcome=exited pid={pid}"));
                break;
            }
            if Instant::now() >= deadline {
                cam_event(
                    "stop",
                    Some(camera),
                    format!(
                        "outcome=grace_expired pid={pid} grace_ms={} decision=kill orphan_possible=true",
                        self.cfg.stop_grace_ms
                    ),
                );
                handle.kill()?;
                break;
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }
        state::remove_record(&self.cfg.run_dir, camera);
        Ok(Some(pid))
    }

    /// Drains every registered worker: terminate all without waiting
    /// individually, sleep one combined grace window, then force-kill the
    /// stragglers. Workers exit concurrently rather than serially.
    pub fn stop_all(&self, grace_ms: u64) {
        let mut drained: Vec<(String, Box<dyn ProcessHandle>)> = {
            let mut reg = self.registry.lock().unwrap_or_else(|p| p.into_inner());
            reg.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        for (camera, handle) in drained.iter_mut() {
            cam_event(
                "stop",
                Some(camera),
                format!("attempt=terminate pid={} scope=all", handle.pid()),
            );
            if let Err(e) = handle.terminate() {
                cam_event(
                    "stop",
                    Some(camera),
                    format!("terminate outcome=error err={e:#}"),
                );
            }
        }
        thread::sleep(Duration::from_millis(grace_ms));
        for (camera, mut handle) in drained {
            if handle.is_alive() {
                cam_event(
                    "stop",
                    Some(&camera),
                    format!(
                        "outcome=grace_expired pid={} decision=kill orphan_possible=true",
                        handle.pid()
                    ),
                );
                if let Err(e) = handle.kill() {
                    cam_event("stop", Some(&camera), format!("kill outcome=error err={e:#}"));
                }
            }
            state::remove_record(&self.cfg.run_dir, &camera);
        }
    }

    /// Primary liveness strategy: poll the registry-owned handle (reaping it
    /// when exited). Without a handle, fall back to the worker's state
    /// record cross-checked against /proc, so a live worker from before a
    /// supervisor restart is not double-launched by the watchdog.
    pub fn is_running(&self, camera: &str) -> bool {
        {
            let mut reg = self.registry.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(handle) = reg.get_mut(camera) {
                if handle.is_alive() {
                    return true;
                }
                reg.remove(camera);
                cam_event("registry", Some(camera), "reaped exited_handle=true");
                return false;
            }
        }
        match state::load_record(&self.cfg.run_dir, camera) {
            Some(rec) => liveness::pid_running_with_script(rec.pid, &rec.script),
            None => false,
        }
    }

    pub fn autolaunch_enabled(&self, camera: &str) -> bool {
        let policy = self.policy.lock().unwrap_or_else(|p| p.into_inner());
        policy.get(camera)
    }

    /// Persists the new policy; when enabling a camera that is not running,
    /// also starts it, reporting `true` so the caller can wait before
    /// re-polling status.
    pub fn set_autolaunch(&self, camera: &str, enabled: bool) -> anyhow::Result<bool> {
        self.ensure_known(camera)?;
        {
            let mut policy = self.policy.lock().unwrap_or_else(|p| p.into_inner());
            policy.set(camera, enabled)?;
        }
        cam_event(
            "policy",
            Some(camera),
            format!("autolaunch set enabled={enabled}"),
        );
        if enabled && !self.is_running(camera) {
            self.start_with_delay(camera, self.cfg.start_delay_ms)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Read-only composition of liveness, worker state record and policy.
    /// Never mutates; safe at arbitrary polling frequency.
    pub fn status(&self, camera: &str) -> anyhow::Result<CameraStatus> {
        self.ensure_known(camera)?;
        let enabled = self.autolaunch_enabled(camera);
        if self.is_running(camera) {
            Ok(match state::load_record(&self.cfg.run_dir, camera) {
                Some(rec) => CameraStatus::from_record(&rec, enabled),
                None => CameraStatus::starting(enabled),
            })
        } else {
            Ok(CameraStatus::offline(enabled))
        }
    }

    /// Status for every configured camera, in configuration order.
    pub fn status_all(&self) -> Vec<(String, CameraStatus)> {
        self.cfg
            .cameras
            .iter()
            .map(|camera| {
                let enabled = self.autolaunch_enabled(camera);
                let status = if self.is_running(camera) {
                    match state::load_record(&self.cfg.run_dir, camera) {
                        Some(rec) => CameraStatus::from_record(&rec, enabled),
                        None => CameraStatus::starting(enabled),
                    }
                } else {
                    CameraStatus::offline(enabled)
                };
                (camera.clone(), status)
            })
            .collect()
    }

    /// Arms the watchdog: a background thread that waits on the shutdown
    /// channel with a jittered period and relaunches every enabled,
    /// not-running camera. Jitter avoids relaunch storms when many
    /// supervisor instances restart together.
    pub fn start_watchdog(self: &Arc<Self>) {
        let (tx, rx) = mpsc::channel::<()>();
        let weak = Arc::downgrade(self);
        let period_ms = self.cfg.watchdog_period_ms;
        let jitter_ms = self.cfg.watchdog_jitter_ms;
        let join = thread::spawn(move || loop {
            let mut wait_ms = period_ms;
            if jitter_ms > 0 {
                wait_ms += rand::thread_rng().gen_range(0..=jitter_ms);
            }
            match rx.recv_timeout(Duration::from_millis(wait_ms)) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    cam_event("watchdog", None, "exit reason=shutdown");
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
            let Some(sup) = weak.upgrade() else { break };
            sup.reconcile(sup.cfg.watchdog_start_delay_ms);
        });
        *self
            .watchdog_stop
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(tx);
        *self
            .watchdog_join
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(join);
    }

    /// One watchdog pass: launch every autolaunch-enabled camera that is
    /// not running. Per-camera failures are logged and do not abort the
    /// scan for the rest.
    pub(crate) fn reconcile(&self, delay_ms: u64) {
        for camera in self.cfg.cameras.clone() {
            if !self.autolaunch_enabled(&camera) {
                continue;
            }
            if self.is_running(&camera) {
                continue;
            }
            cam_event("watchdog", Some(&camera), "attempt=relaunch");
            if let Err(e) = self.start_with_delay(&camera, delay_ms) {
                cam_event(
                    "watchdog",
                    Some(&camera),
                    format!("relaunch outcome=error err={e:#}"),
                );
            }
        }
    }

    /// Full teardown: stop the watchdog (so it cannot relaunch mid-drain),
    /// then drain all workers. Safe to call more than once.
    pub fn shutdown(&self) {
        let tx = self
            .watchdog_stop
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        let join = self
            .watchdog_join
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(join) = join {
            let _ = join.join();
        }
        self.stop_all(self.cfg.stop_grace_ms);
    }

    /// Asks the hosting process to terminate itself via its normal SIGTERM
    /// path. Used by "restart everything" flows where an outer process
    /// manager relaunches the host after it exits.
    pub fn request_self_termination(&self) -> anyhow::Result<()> {
        cam_event("shutdown", None, "self_termination sig=SIGTERM");
        kill(getpid(), Signal::SIGTERM).map_err(|e| anyhow::anyhow!("SIGTERM to self: {e}"))
    }
}

/// Disposes of a worker that slipped into the registry between a stop and
/// the subsequent insert. Signal failures here cannot abort the caller's
/// launch, but they are logged rather than dropped.
fn evict_raced_instance(reg: &mut HashMap<String, Box<dyn ProcessHandle>>, camera: &str) {
    let Some(mut old) = reg.remove(camera) else {
        return;
    };
    cam_event(
        "start",
        Some(camera),
        format!("raced_instance pid={} decision=kill", old.pid()),
    );
    if let Err(e) = old.terminate() {
        cam_event(
            "start",
            Some(camera),
            format!("raced_instance terminate outcome=error err={e:#}"),
        );
    }
    if let Err(e) = old.kill() {
        cam_event(
            "start",
            Some(camera),
            format!("raced_instance kill outcome=error err={e:#}"),
        );
    }
}
