use std::path::Path;

/// Cross-process liveness check for a PID recorded by a worker state file.
///
/// A bare PID match is insufficient because PIDs recycle; the command line
/// must also contain the expected worker script name. A PID that no longer
/// exists reads as not-running, never as an error.
pub fn pid_running_with_script(pid: i32, script_name: &str) -> bool {
    if pid <= 0 || script_name.is_empty() {
        return false;
    }
    match read_cmdline(pid) {
        Some(cmdline) => cmdline.contains(script_name),
        None => false,
    }
}

/// `/proc/<pid>/cmdline` is NUL-separated argv; a kernel thread or an exiting
/// process can expose an empty file, which also reads as not-running.
fn read_cmdline(pid: i32) -> Option<String> {
    let path = format!("/proc/{pid}/cmdline");
    if !Path::new(&path).exists() {
        return None;
    }
    let bytes = std::fs::read(path).ok()?;
    let joined = bytes
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).to_string())
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_exe_name() -> String {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|os| os.to_string_lossy().to_string()))
            .expect("test binary has a file name")
    }

    #[test]
    fn own_pid_matches_own_command_line() {
        let pid = std::process::id() as i32;
        assert!(pid_running_with_script(pid, &own_exe_name()));
    }

    #[test]
    fn pid_reuse_guard_rejects_wrong_script() {
        let pid = std::process::id() as i32;
        assert!(!pid_running_with_script(pid, "definitely-not-this-worker.py"));
    }

    #[test]
    fn dead_or_invalid_pid_is_not_running() {
        assert!(!pid_running_with_script(0, "worker.py"));
        assert!(!pid_running_with_script(-1, "worker.py"));
        // Far above any realistic pid_max.
        assert!(!pid_running_with_script(999_999_999, "worker.py"));
    }

    #[test]
    fn empty_script_name_never_matches() {
        let pid = std::process::id() as i32;
        assert!(!pid_running_with_script(pid, ""));
    }
}
