use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::cam::build_info;
use crate::cam::state::CameraStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Request {
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Enable { name: String },
    Disable { name: String },
    Status {
        #[serde(default)]
        name: Option<String>,
    },
    Shutdown,
}

/// Build identity of the connecting client. The daemon rejects requests from
/// a binary of a different build; mixed deployments otherwise fail in
/// confusing ways.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub build_time: String,
    pub build_host: String,
}

impl ClientInfo {
    pub fn current() -> Self {
        Self {
            build_time: build_info::build_time_raw().to_string(),
            build_host: build_info::build_host().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub client: ClientInfo,
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEntry {
    pub camera: String,
    #[serde(flatten)]
    pub status: CameraStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub statuses: Vec<StatusEntry>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            statuses: vec![],
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            statuses: vec![],
        }
    }

    pub fn with_statuses(statuses: Vec<StatusEntry>) -> Self {
        Self {
            ok: true,
            message: String::new(),
            statuses,
        }
    }

    pub fn render_text(&self) -> String {
        if !self.message.is_empty() && self.statuses.is_empty() {
            return self.message.clone();
        }
        if self.statuses.is_empty() {
            return "(no cameras)".to_string();
        }

        fn pad(s: &str, width: usize) -> String {
            if s.len() >= width {
                return s.to_string();
            }
            let mut out = String::with_capacity(width);
            out.push_str(s);
            out.push_str(&" ".repeat(width - s.len()));
            out
        }

        fn border(widths: &[usize]) -> String {
            let mut out = String::new();
            out.push('+');
            for w in widths {
                // 1 leading + 1 trailing padding space per cell.
                out.push_str(&"-".repeat(*w + 2));
                out.push('+');
            }
            out
        }

        fn row_line(cols: &[String], widths: &[usize]) -> String {
            let mut out = String::new();
            out.push('|');
            for (i, w) in widths.iter().enumerate() {
                let v = cols.get(i).map(|s| s.as_str()).unwrap_or("");
                out.push(' ');
                out.push_str(&pad(v, *w));
                out.push(' ');
                out.push('|');
            }
            out
        }

        let headers = vec!["camera", "state", "standby", "autolaunch", "status", "updated"];

        let rows: Vec<Vec<String>> = self
            .statuses
            .iter()
            .map(|e| {
                let st = &e.status;
                vec![
                    e.camera.clone(),
                    if st.is_running { "RUNNING" } else { "STOPPED" }.to_string(),
                    if st.in_standby { "yes" } else { "-" }.to_string(),
                    if st.autolaunch_enabled {
                        "enabled"
                    } else {
                        "disabled"
                    }
                    .to_string(),
                    st.description.clone(),
                    if st.timestamp.is_empty() {
                        "-".to_string()
                    } else {
                        st.timestamp.clone()
                    },
                ]
            })
            .collect();

        let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
        for r in &rows {
            for (i, c) in r.iter().enumerate() {
                widths[i] = widths[i].max(c.len());
            }
        }

        let mut out = String::new();
        let top = border(&widths);
        out.push_str(&top);
        out.push('\n');
        out.push_str(&row_line(
            &headers.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &widths,
        ));
        out.push('\n');
        out.push_str(&top);
        out.push('\n');
        for r in &rows {
            out.push_str(&row_line(r, &widths));
            out.push('\n');
        }
        out.push_str(&top);
        out.push('\n');
        out
    }
}

pub fn client_call(sock: &Path, req: Request) -> anyhow::Result<Response> {
    let mut stream = UnixStream::connect(sock).map_err(|e| {
        anyhow::anyhow!(
            "failed to connect to cammaster socket {}: {e}",
            sock.display()
        )
    })?;

    let wire = WireRequest {
        client: ClientInfo::current(),
        request: req,
    };
    let line = serde_json::to_string(&wire)? + "\n";
    stream.write_all(line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut resp_line = String::new();
    reader.read_line(&mut resp_line)?;
    if resp_line.trim().is_empty() {
        anyhow::bail!("empty response from daemon");
    }
    let resp: Response = serde_json::from_str(resp_line.trim_end())?;
    if !resp.ok {
        anyhow::bail!("{}", resp.message);
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;

    #[test]
    fn requests_use_the_tagged_wire_shape() {
        let j = serde_json::to_value(Request::Start {
            name: "gate".to_string(),
        })
        .unwrap();
        assert_eq!(j["type"], "Start");
        assert_eq!(j["data"]["name"], "gate");

        let j = serde_json::to_value(Request::Shutdown).unwrap();
        assert_eq!(j["type"], "Shutdown");

        // Status name defaults to None when omitted.
        let req: Request =
            serde_json::from_str(r#"{"type":"Status","data":{}}"#).unwrap();
        match req {
            Request::Status { name } => assert!(name.is_none()),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn status_entries_flatten_into_one_object() {
        let entry = StatusEntry {
            camera: "gate".to_string(),
            status: CameraStatus::offline(true),
        };
        let j = serde_json::to_value(&entry).unwrap();
        assert_eq!(j["camera"], "gate");
        assert_eq!(j["is_running"], false);
        assert_eq!(j["description"], "reconnecting");
    }

    #[test]
    fn render_text_prefers_the_message_for_plain_replies() {
        let r = Response::ok("camera gate started");
        assert_eq!(r.render_text(), "camera gate started");
    }

    #[test]
    fn render_text_draws_one_row_per_camera() {
        let r = Response::with_statuses(vec![
            StatusEntry {
                camera: "gate".to_string(),
                status: CameraStatus::offline(false),
            },
            StatusEntry {
                camera: "dock".to_string(),
                status: CameraStatus::starting(true),
            },
        ]);
        let text = r.render_text();
        assert!(text.contains("| camera"));
        assert!(text.contains("| gate"));
        assert!(text.contains("| dock"));
        assert!(text.contains("RUNNING"));
        assert!(text.contains("STOPPED"));
        assert!(text.starts_with('+'));
    }

    #[test]
    fn client_call_round_trips_over_a_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("ctl.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let wire: WireRequest = serde_json::from_str(line.trim_end()).unwrap();
            let resp = match wire.request {
                Request::Stop { name } => Response::ok(format!("camera {name} stopped")),
                other => Response::err(format!("unexpected request: {other:?}")),
            };
            let mut stream = stream;
            let out = serde_json::to_string(&resp).unwrap() + "\n";
            stream.write_all(out.as_bytes()).unwrap();
        });

        let resp = client_call(
            &sock,
            Request::Stop {
                name: "gate".to_string(),
            },
        )
        .unwrap();
        assert!(resp.ok);
        assert_eq!(resp.message, "camera gate stopped");
        server.join().unwrap();
    }

    #[test]
    fn client_call_surfaces_daemon_errors() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("ctl.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let out = serde_json::to_string(&Response::err("unknown camera: nope")).unwrap() + "\n";
            stream.write_all(out.as_bytes()).unwrap();
        });

        let err = client_call(
            &sock,
            Request::Start {
                name: "nope".to_string(),
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown camera"));
        server.join().unwrap();
    }
}
