use crate::cam::config::SupervisorConfig;
use crate::cam::daemon::cam_event;
use anyhow::Context as _;
use chrono::Local;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{setsid, Pid};
use std::fs::File;
use std::os::unix::process::CommandExt as _;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

/// Exclusive handle to a launched worker process: poll, graceful terminate,
/// forced kill. Owned by exactly one registry entry at a time.
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;
    /// Polls exit status without blocking; false once the process has exited.
    fn is_alive(&mut self) -> bool;
    /// Requests cooperative shutdown (SIGTERM). A process that is already
    /// gone is not an error.
    fn terminate(&mut self) -> anyhow::Result<()>;
    /// Forced kill (SIGKILL). "Process already gone" counts as success; that
    /// was the goal.
    fn kill(&mut self) -> anyhow::Result<()>;
}

/// Seam between the supervisor and the OS so tests can drive the registry
/// with scripted processes.
pub trait Spawner: Send + Sync {
    fn spawn(&self, cfg: &SupervisorConfig, camera: &str) -> anyhow::Result<Box<dyn ProcessHandle>>;
}

/// Production spawner: `<interpreter> <script> --camera <name>
/// [--location <loc>]`, detached, stdin closed, stdout/stderr bound to
/// per-camera per-session log files.
pub struct WorkerSpawner;

impl Spawner for WorkerSpawner {
    fn spawn(&self, cfg: &SupervisorConfig, camera: &str) -> anyhow::Result<Box<dyn ProcessHandle>> {
        let (out_path, out_file, err_path, err_file) = open_worker_logs(cfg, camera)?;

        let mut cmd = Command::new(&cfg.interpreter);
        cmd.arg(&cfg.worker_script).arg("--camera").arg(camera);
        if let Some(loc) = cfg.location.as_deref() {
            cmd.arg("--location").arg(loc);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(out_file))
            .stderr(Stdio::from(err_file));
        // Child side: detach from the supervisor's controlling terminal so a
        // signal aimed at the daemon's session never reaches workers.
        unsafe {
            cmd.pre_exec(|| {
                let _ = setsid();
                Ok(())
            });
        }

        let child = cmd.spawn().with_context(|| {
            format!(
                "spawn worker camera={camera} interpreter={} script={}",
                cfg.interpreter.display(),
                cfg.worker_script.display()
            )
        })?;
        cam_event(
            "launch",
            Some(camera),
            format!(
                "spawned pid={} stdout={} stderr={}",
                child.id(),
                out_path.display(),
                err_path.display()
            ),
        );
        Ok(Box::new(WorkerHandle { child }))
    }
}

/// One pair of log files per launch, named by session timestamp so a single
/// file never grows unbounded across runs.
fn open_worker_logs(
    cfg: &SupervisorConfig,
    camera: &str,
) -> anyhow::Result<(PathBuf, File, PathBuf, File)> {
    let dir = cfg.log_dir.join(camera);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create worker log dir {}", dir.display()))?;
    let session = Local::now().format("%Y%m%d_%H%M%S");
    let out_path = dir.join(format!("{session}.out.log"));
    let err_path = dir.join(format!("{session}.err.log"));
    let out_file = File::options()
        .create(true)
        .append(true)
        .open(&out_path)
        .with_context(|| format!("open worker stdout log {}", out_path.display()))?;
    let err_file = File::options()
        .create(true)
        .append(true)
        .open(&err_path)
        .with_context(|| format!("open worker stderr log {}", err_path.display()))?;
    Ok((out_path, out_file, err_path, err_file))
}

pub struct WorkerHandle {
    child: Child,
}

impl ProcessHandle for WorkerHandle {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        // try_wait also reaps the child once it has exited.
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        match kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("SIGTERM pid={}: {e}", self.child.id())),
        }
    }

    fn kill(&mut self) -> anyhow::Result<()> {
        match kill(Pid::from_raw(self.child.id() as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(anyhow::anyhow!("SIGKILL pid={}: {e}", self.child.id())),
        }
        // Reap so the kill leaves no zombie behind.
        let _ = self.child.wait();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::time::{Duration, Instant};

    fn shell_config(dir: &std::path::Path, script_body: &str) -> SupervisorConfig {
        let script = dir.join("worker.sh");
        let mut f = File::create(&script).unwrap();
        f.write_all(script_body.as_bytes()).unwrap();
        SupervisorConfig {
            interpreter: "/bin/sh".into(),
            worker_script: script,
            location: Some("test-loc".to_string()),
            cameras: vec!["gate".to_string()],
            run_dir: dir.join("run"),
            log_dir: dir.join("logs"),
            autolaunch_file: dir.join("autolaunch.json"),
            autolaunch_default: false,
            watchdog_period_ms: 1_000,
            watchdog_jitter_ms: 0,
            stop_grace_ms: 2_000,
            start_delay_ms: 0,
            watchdog_start_delay_ms: 0,
            sock: dir.join("ctl.sock"),
        }
    }

    fn wait_until_dead(handle: &mut Box<dyn ProcessHandle>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !handle.is_alive() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn spawns_polls_and_terminates_a_real_worker() {
        let dir = tempfile::tempdir().unwrap();
        // The stand-in worker ignores its --camera/--location args and idles.
        let cfg = shell_config(dir.path(), "sleep 30\n");

        let mut handle = WorkerSpawner.spawn(&cfg, "gate").unwrap();
        assert!(handle.pid() > 0);
        assert!(handle.is_alive());
        // Per-camera log directory was created for this session.
        assert!(cfg.log_dir.join("gate").is_dir());

        handle.terminate().unwrap();
        assert!(wait_until_dead(&mut handle, Duration::from_secs(5)));
        // Signalling an exited process stays quiet.
        handle.terminate().unwrap();
        handle.kill().unwrap();
    }

    #[test]
    fn kill_succeeds_when_process_already_exited() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = shell_config(dir.path(), "exit 0\n");
        let mut handle = WorkerSpawner.spawn(&cfg, "gate").unwrap();
        assert!(wait_until_dead(&mut handle, Duration::from_secs(5)));
        handle.kill().unwrap();
    }

    #[test]
    fn spawn_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = shell_config(dir.path(), "sleep 1\n");
        cfg.interpreter = dir.path().join("no-such-interpreter");
        assert!(WorkerSpawner.spawn(&cfg, "gate").is_err());
    }
}
