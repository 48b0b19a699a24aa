//! OS process and port inspection behind a single capability trait
//!
//! The supervisor's state machine is written once against [`ProcessProbe`];
//! the platform-specific shell-outs (`pgrep`/`lsof`/`ss` on Unix,
//! `tasklist`/`netstat`/`taskkill` on Windows) live here. Tests inject a
//! fake implementation instead.

use std::io;
use std::process::Command;
use std::sync::Arc;

/// How to recognize the managed executable among running processes
#[derive(Debug, Clone)]
pub struct ProcessQuery {
    /// Image name without extension, e.g. `caddy`
    pub image: String,
    /// Command-line pattern for `pgrep -f` matching
    pub cmdline: String,
}

impl ProcessQuery {
    /// Match `<image> run` / `<image> start` invocations, the command
    /// forms the supervisor launches the executable with
    pub fn for_image(image: impl Into<String>) -> Self {
        let image = image.into();
        let cmdline = format!(r"{image}\s+(run|start)");
        Self { image, cmdline }
    }
}

/// Injected process/port inspection capability
pub trait ProcessProbe: Send + Sync {
    /// Whether `pid` resolves to a live OS process
    fn pid_alive(&self, pid: u32) -> bool;

    /// PIDs of every running process matching the managed invocation pattern
    fn find_managed(&self, query: &ProcessQuery) -> Vec<u32>;

    /// Human-readable description of whoever holds `port`, if resolvable
    fn port_holder(&self, port: u16) -> Option<String>;

    /// Ask the process to exit (SIGTERM / `taskkill`)
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Force the process down (SIGKILL / `taskkill /F`)
    fn kill(&self, pid: u32) -> io::Result<()>;
}

/// The probe implementation for the current platform
pub fn native() -> Arc<dyn ProcessProbe> {
    #[cfg(unix)]
    {
        Arc::new(UnixProbe)
    }
    #[cfg(windows)]
    {
        Arc::new(WindowsProbe)
    }
}

#[cfg(unix)]
pub struct UnixProbe;

#[cfg(unix)]
impl ProcessProbe for UnixProbe {
    fn pid_alive(&self, pid: u32) -> bool {
        // signal 0 probes existence without delivering anything
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    fn find_managed(&self, query: &ProcessQuery) -> Vec<u32> {
        let output = match Command::new("pgrep").arg("-f").arg(&query.cmdline).output() {
            Ok(output) => output,
            Err(_) => return Vec::new(),
        };
        if !output.status.success() {
            return Vec::new();
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect()
    }

    fn port_holder(&self, port: u16) -> Option<String> {
        match Command::new("lsof").arg(format!("-i:{port}")).output() {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                // first line is the header
                let fields: Vec<&str> = stdout.lines().nth(1)?.split_whitespace().collect();
                if fields.len() >= 2 {
                    return Some(format!("{} (PID {})", fields[0], fields[1]));
                }
                None
            }
            // lsof absent or unhelpful: fall back to ss
            _ => {
                let output = Command::new("ss").arg("-tlnp").output().ok()?;
                let stdout = String::from_utf8_lossy(&output.stdout);
                let needle = format!(":{port} ");
                for line in stdout.lines() {
                    if line.contains(&needle) && line.contains("LISTEN") {
                        if let Some((_, users)) = line.split_once("users:") {
                            return Some(users.trim().to_string());
                        }
                        return Some("unknown process".to_string());
                    }
                }
                None
            }
        }
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
pub struct WindowsProbe;

#[cfg(windows)]
impl ProcessProbe for WindowsProbe {
    fn pid_alive(&self, pid: u32) -> bool {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}")])
            .output()
            .map(|output| String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }

    fn find_managed(&self, query: &ProcessQuery) -> Vec<u32> {
        let image = format!("{}.exe", query.image);
        let output = match Command::new("tasklist")
            .args(["/FI", &format!("IMAGENAME eq {image}"), "/FO", "CSV"])
            .output()
        {
            Ok(output) => output,
            Err(_) => return Vec::new(),
        };
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .skip(1)
            .filter(|line| line.contains(&image))
            .filter_map(|line| {
                let mut fields = line.split(',');
                let pid = fields.nth(1)?.trim_matches('"');
                pid.parse::<u32>().ok()
            })
            .collect()
    }

    fn port_holder(&self, port: u16) -> Option<String> {
        let output = Command::new("netstat").arg("-ano").output().ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let needle = format!(":{port}");
        for line in stdout.lines() {
            if line.contains(&needle) && line.contains("LISTENING") {
                if let Some(pid) = line.split_whitespace().last() {
                    return Some(format!("PID {pid}"));
                }
            }
        }
        None
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let status = Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .output()?
            .status;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::Other, "taskkill failed"))
        }
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        let status = Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .output()?
            .status;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::Other, "taskkill /F failed"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_pattern_covers_run_and_start() {
        let query = ProcessQuery::for_image("caddy");
        assert_eq!(query.image, "caddy");
        assert_eq!(query.cmdline, r"caddy\s+(run|start)");
    }

    #[cfg(unix)]
    #[test]
    fn test_own_pid_is_alive() {
        let probe = UnixProbe;
        assert!(probe.pid_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_pid_reports_not_alive() {
        let probe = UnixProbe;
        // spawn a short-lived child and wait for it; its pid is then free
        let mut child = Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait");
        assert!(!probe.pid_alive(pid));
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_missing_pid_errors() {
        let probe = UnixProbe;
        // pid_max on Linux defaults well below this
        assert!(probe.terminate(u32::MAX / 2).is_err());
    }
}
