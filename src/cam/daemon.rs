use anyhow::Context as _;
use chrono::Local;
use std::fs;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader as TokioBufReader};
use tokio::net::UnixListener as TokioUnixListener;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::time as tokio_time;

use crate::cam::config::SupervisorConfig;
use crate::cam::launcher::WorkerSpawner;
use crate::cam::rpc::{Request, Response, StatusEntry, WireRequest};
use crate::cam::supervisor::Supervisor;

/// Timestamped event line on stderr (journald picks these up when running
/// under systemd). `camera` scopes the event to one worker where that makes
/// sense.
pub(crate) fn cam_event(component: &str, camera: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    match camera {
        Some(c) => eprintln!("{ts} [{component}] camera={c} {}", msg.as_ref()),
        None => eprintln!("{ts} [{component}] {}", msg.as_ref()),
    }
}

pub fn run_daemon(cfg: &SupervisorConfig) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(run_daemon_async(cfg.clone()))
}

pub async fn run_daemon_async(cfg: SupervisorConfig) -> anyhow::Result<()> {
    let sock = cfg.sock.clone();
    prepare_socket(&sock)?;
    let listener = TokioUnixListener::bind(&sock)
        .map_err(|e| anyhow::anyhow!("failed to bind socket {}: {e}", sock.display()))?;

    let shutting_down = Arc::new(AtomicBool::new(false));

    let build_time = option_env!("CAMMASTER_BUILD_TIME").unwrap_or("unknown");
    let build_host = option_env!("CAMMASTER_BUILD_HOST").unwrap_or("unknown");
    cam_event(
        "boot",
        None,
        format!(
            "build_time={build_time} build_host={build_host} cameras={}",
            cfg.cameras.len()
        ),
    );

    let sup = Supervisor::new(cfg.clone(), Box::new(WorkerSpawner))?;

    // Launch every autolaunch-enabled camera before accepting control
    // connections, so the first status query already reflects the fleet.
    {
        let sup = Arc::clone(&sup);
        let delay_ms = cfg.start_delay_ms;
        tokio::task::spawn_blocking(move || sup.reconcile(delay_ms))
            .await
            .map_err(|e| anyhow::anyhow!("join error: {e}"))?;
    }

    sup.start_watchdog();
    start_signal_listener_async(Arc::clone(&shutting_down));

    cam_event("rpc", None, format!("listening sock={}", sock.display()));
    serve_until_shutdown(listener, sup, shutting_down, sock).await
}

/// Accepts control connections until the shutdown flag is set, then drains
/// every worker (watchdog first) and removes the socket. The function does
/// not return before the drain completes, so "flag set" to "process exits"
/// always passes through one full `Supervisor::shutdown`.
async fn serve_until_shutdown(
    listener: TokioUnixListener,
    sup: Arc<Supervisor>,
    shutting_down: Arc<AtomicBool>,
    sock: std::path::PathBuf,
) -> anyhow::Result<()> {
    while !shutting_down.load(Ordering::Relaxed) {
        tokio::select! {
            r = listener.accept() => {
                match r {
                    Ok((stream, _addr)) => {
                        let sup = Arc::clone(&sup);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection_async(sup, stream).await {
                                eprintln!("rpc error: {e:#}");
                            }
                        });
                    }
                    Err(e) => {
                        eprintln!("accept error: {e}");
                        tokio_time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
            _ = tokio_time::sleep(Duration::from_millis(200)) => {
                // Periodic wake so the loop observes shutting_down without
                // depending on a new connection.
            }
        }
    }

    cam_event("shutdown", None, "signal received; stopping all workers");
    {
        let sup = Arc::clone(&sup);
        tokio::task::spawn_blocking(move || sup.shutdown())
            .await
            .map_err(|e| anyhow::anyhow!("join error: {e}"))?;
    }
    // Remove the socket so clients fail fast until the next start.
    let _ = fs::remove_file(&sock);
    cam_event("shutdown", None, "done");
    Ok(())
}

fn prepare_socket(sock: &Path) -> anyhow::Result<()> {
    if let Some(parent) = sock.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            anyhow::anyhow!(
                "failed to create socket directory {}: {e}",
                parent.display()
            )
        })?;
    }
    if sock.exists() {
        // If something is already listening, fail. Otherwise remove the
        // stale socket from an unclean shutdown.
        match StdUnixStream::connect(sock) {
            Ok(_) => anyhow::bail!(
                "cammaster daemon already running (socket {} is accepting connections)",
                sock.display()
            ),
            Err(_) => {
                fs::remove_file(sock).map_err(|e| {
                    anyhow::anyhow!("failed to remove stale socket {}: {e}", sock.display())
                })?;
            }
        }
    }
    Ok(())
}

fn start_signal_listener_async(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut term = unix_signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut int = unix_signal(SignalKind::interrupt()).expect("SIGINT handler");
        tokio::select! {
            _ = term.recv() => { flag.store(true, Ordering::Relaxed); }
            _ = int.recv() => { flag.store(true, Ordering::Relaxed); }
        }
    });
}

async fn handle_connection_async(
    sup: Arc<Supervisor>,
    stream: tokio::net::UnixStream,
) -> anyhow::Result<()> {
    let mut reader = TokioBufReader::new(stream);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 || line.trim().is_empty() {
        return Ok(());
    }
    let wire: WireRequest = serde_json::from_str(line.trim_end())?;
    let mut stream = reader.into_inner();

    let daemon_build_time = option_env!("CAMMASTER_BUILD_TIME").unwrap_or("unknown");
    let daemon_build_host = option_env!("CAMMASTER_BUILD_HOST").unwrap_or("unknown");
    let resp = if wire.client.build_time != daemon_build_time
        || wire.client.build_host != daemon_build_host
    {
        Response::err(format!(
            "client is not co-built with this daemon.\n\
daemon: build_time={daemon_build_time} build_host={daemon_build_host}\n\
client: build_time={} build_host={}\n\
\n\
Fix: use the cammaster binary built from the same release as the running daemon.",
            wire.client.build_time, wire.client.build_host
        ))
    } else {
        match dispatch_async(sup, wire.request).await {
            Ok(r) => r,
            // Full anyhow chain so operators can debug spawn failures.
            Err(e) => Response::err(format!("{e:#}")),
        }
    };
    let resp_line = serde_json::to_string(&resp)? + "\n";
    stream.write_all(resp_line.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

async fn run_blocking<F>(sup: Arc<Supervisor>, f: F) -> anyhow::Result<Response>
where
    F: FnOnce(&Supervisor) -> anyhow::Result<Response> + Send + 'static,
{
    // Supervisor operations block (grace waits, post-launch delays); keep
    // them off the async worker threads.
    tokio::task::spawn_blocking(move || f(&sup))
        .await
        .map_err(|e| anyhow::anyhow!("join error: {e}"))?
}

pub(crate) async fn dispatch_async(
    sup: Arc<Supervisor>,
    req: Request,
) -> anyhow::Result<Response> {
    match req {
        Request::Start { name } => {
            run_blocking(sup, move |s| {
                s.start(&name)?;
                Ok(Response::ok(format!("camera {name} started")))
            })
            .await
        }
        Request::Stop { name } => {
            run_blocking(sup, move |s| {
                Ok(match s.stop(&name)? {
                    Some(pid) => Response::ok(format!("camera {name} stopped (pid {pid})")),
                    None => Response::ok(format!("camera {name} was not running")),
                })
            })
            .await
        }
        Request::Restart { name } => {
            run_blocking(sup, move |s| {
                s.restart(&name)?;
                Ok(Response::ok(format!("camera {name} restarted")))
            })
            .await
        }
        Request::Enable { name } => {
            run_blocking(sup, move |s| {
                Ok(if s.set_autolaunch(&name, true)? {
                    Response::ok(format!("camera {name} autolaunch enabled; worker launched"))
                } else {
                    Response::ok(format!("camera {name} autolaunch enabled"))
                })
            })
            .await
        }
        Request::Disable { name } => {
            run_blocking(sup, move |s| {
                s.set_autolaunch(&name, false)?;
                Ok(Response::ok(format!(
                    "camera {name} autolaunch disabled (running worker left alone)"
                )))
            })
            .await
        }
        Request::Status { name } => {
            run_blocking(sup, move |s| {
                let statuses = match name {
                    Some(n) => vec![StatusEntry {
                        camera: n.clone(),
                        status: s.status(&n)?,
                    }],
                    None => s
                        .status_all()
                        .into_iter()
                        .map(|(camera, status)| StatusEntry { camera, status })
                        .collect(),
                };
                Ok(Response::with_statuses(statuses))
            })
            .await
        }
        Request::Shutdown => {
            sup.request_self_termination()?;
            Ok(Response::ok("supervisor terminating"))
        }
    }
}
