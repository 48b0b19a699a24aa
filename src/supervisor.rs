//! Lifecycle supervisor for the managed Caddy process
//!
//! Owns the one authoritative [`ManagedProcessHandle`] and the state
//! machine behind `deploy`/`undeploy`: render and validate the config,
//! launch the process detached, poll it up with log-based failure
//! classification, and stop it gracefully with an orphan sweep. All OS
//! inspection goes through the injected [`ProcessProbe`] so the machine
//! is written once and testable with fakes.

use crate::caddyfile::{self, ServiceConfig};
use crate::endpoint::EndpointChecker;
use crate::error::{DeployError, StartupErrorKind};
use crate::logs;
use crate::probe::{ProcessProbe, ProcessQuery};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Caddy's fixed admin API port, part of the pre-start conflict sweep
pub const ADMIN_PORT: u16 = 2019;

/// How many trailing log lines feed startup-failure classification
const STARTUP_SCAN_LINES: usize = 10;

/// Lifecycle states of the managed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    StartFailed,
}

/// On-disk layout of the supervisor's state directory
#[derive(Debug, Clone)]
pub struct StatePaths {
    state_dir: PathBuf,
}

impl StatePaths {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join("Caddyfile")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("caddy.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("caddy.log")
    }

    pub fn ensure_exists(&self) -> io::Result<()> {
        fs::create_dir_all(&self.state_dir)
    }
}

/// Timing knobs for the start/stop transitions. Tests shrink these.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Bounded startup polling: iterations x interval
    pub start_poll_iterations: u32,
    pub start_poll_interval: Duration,
    /// How long to wait after SIGTERM before escalating to SIGKILL
    pub stop_grace_period: Duration,
    /// Poll interval while waiting out the grace period
    pub stop_poll_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            start_poll_iterations: 10,
            start_poll_interval: Duration::from_secs(1),
            stop_grace_period: Duration::from_secs(2),
            stop_poll_interval: Duration::from_millis(100),
        }
    }
}

/// The one authoritative handle to the managed process. Invalidated on
/// stop or when the OS reports the pid gone.
#[derive(Debug, Clone)]
pub struct ManagedProcessHandle {
    pub pid: Option<u32>,
    pub pid_file: PathBuf,
}

impl ManagedProcessHandle {
    /// Load whatever handle the pid file records (plain decimal text)
    pub fn load(pid_file: PathBuf) -> Self {
        let pid = fs::read_to_string(&pid_file)
            .ok()
            .and_then(|content| content.trim().parse::<u32>().ok());
        Self { pid, pid_file }
    }

    fn persist(&self) -> io::Result<()> {
        match self.pid {
            Some(pid) => fs::write(&self.pid_file, format!("{pid}\n")),
            None => match fs::remove_file(&self.pid_file) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
        }
    }
}

/// Snapshot reported by the `status` command
#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub state: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub caddy_path: String,
    pub config_file: String,
    pub pid_file: String,
    pub log_file: String,
}

/// One advisory port-conflict observation from the pre-start sweep
#[derive(Debug, Clone)]
pub struct PortConflict {
    pub port: u16,
    pub holder: Option<String>,
}

pub struct Supervisor {
    paths: StatePaths,
    binary: PathBuf,
    probe: Arc<dyn ProcessProbe>,
    endpoints: EndpointChecker,
    options: SupervisorOptions,
}

impl Supervisor {
    pub fn new(
        paths: StatePaths,
        binary: PathBuf,
        probe: Arc<dyn ProcessProbe>,
        endpoints: EndpointChecker,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            paths,
            binary,
            probe,
            endpoints,
            options,
        }
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn probe(&self) -> &Arc<dyn ProcessProbe> {
        &self.probe
    }

    pub fn endpoints(&self) -> &EndpointChecker {
        &self.endpoints
    }

    /// How running instances of the managed executable are recognized
    pub fn process_query(&self) -> ProcessQuery {
        let image = self
            .binary
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "caddy".to_string());
        ProcessQuery::for_image(image)
    }

    /// Pid recorded in the persisted handle, if any
    pub fn recorded_pid(&self) -> Option<u32> {
        ManagedProcessHandle::load(self.paths.pid_file()).pid
    }

    /// True iff the recorded pid is alive, or any process matches the
    /// managed invocation pattern (catches orphans whose handle was lost)
    pub fn is_running(&self) -> bool {
        if let Some(pid) = self.recorded_pid() {
            if self.probe.pid_alive(pid) {
                return true;
            }
        }
        !self.probe.find_managed(&self.process_query()).is_empty()
    }

    /// Observable state between invocations. `Starting`/`StartFailed`
    /// only exist inside a deploy in flight.
    pub fn state(&self) -> ServiceState {
        if self.is_running() {
            ServiceState::Running
        } else {
            ServiceState::Stopped
        }
    }

    pub fn status(&self) -> ServiceStatus {
        let running = self.is_running();
        ServiceStatus {
            running,
            state: if running {
                ServiceState::Running
            } else {
                ServiceState::Stopped
            },
            pid: if running { self.recorded_pid() } else { None },
            caddy_path: self.binary.display().to_string(),
            config_file: self.paths.config_file().display().to_string(),
            pid_file: self.paths.pid_file().display().to_string(),
            log_file: self.paths.log_file().display().to_string(),
        }
    }

    /// Run the external validator against the persisted config document
    pub async fn validate_config(&self) -> Result<(), DeployError> {
        let config_file = self.paths.config_file();
        if !self.binary.exists() {
            return Err(DeployError::BinaryMissing {
                path: self.binary.display().to_string(),
            });
        }
        if !config_file.exists() {
            return Err(DeployError::ConfigInvalid {
                detail: format!("configuration file not found: {}", config_file.display()),
            });
        }

        let output = tokio::time::timeout(
            Duration::from_secs(10),
            tokio::process::Command::new(&self.binary)
                .arg("validate")
                .arg("--config")
                .arg(&config_file)
                .output(),
        )
        .await
        .map_err(|_| DeployError::ConfigInvalid {
            detail: "validator did not finish within 10s".to_string(),
        })??;

        if output.status.success() {
            debug!("configuration validated");
            Ok(())
        } else {
            Err(DeployError::ConfigInvalid {
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Deploy the service: conflict sweep, render + validate, detached
    /// launch, bounded startup polling. Returns the new pid.
    ///
    /// Calling this while the service runs performs an implicit
    /// `undeploy` first (cold-restart semantics).
    pub async fn deploy(&self, config: &ServiceConfig) -> Result<u32, DeployError> {
        if !self.binary.exists() {
            return Err(DeployError::BinaryMissing {
                path: self.binary.display().to_string(),
            });
        }

        self.paths.ensure_exists()?;
        let rendered = caddyfile::render(config, self.paths.state_dir());

        // Advisory conflict sweep over the admin port and every port the
        // new configuration implies. A stale managed instance is folded
        // into this deploy; a foreign holder is only warned about.
        let conflicts = self.port_conflicts(&rendered).await;
        if !conflicts.is_empty() {
            let stale = self.probe.find_managed(&self.process_query());
            if !stale.is_empty() {
                info!(
                    count = stale.len(),
                    "Ports held by a previous managed instance, stopping it"
                );
                self.undeploy().await?;
            } else {
                for conflict in &conflicts {
                    warn!(
                        port = conflict.port,
                        holder = conflict.holder.as_deref().unwrap_or("unknown process"),
                        "Port already bound by a foreign process, continuing anyway"
                    );
                }
            }
        }

        if self.is_running() {
            info!("Service already running, performing cold restart");
            self.undeploy().await?;
        }

        fs::write(self.paths.config_file(), &rendered)?;
        self.validate_config().await?;

        debug!(state = ?ServiceState::Starting, "Launching service");
        let log_offset = fs::metadata(self.paths.log_file())
            .map(|meta| meta.len())
            .unwrap_or(0);
        let mut child = self.spawn_detached()?;
        let pid = child.id();

        let handle = ManagedProcessHandle {
            pid: Some(pid),
            pid_file: self.paths.pid_file(),
        };
        handle.persist()?;

        info!(pid, "Service launched, waiting for startup");
        let mut exited = false;
        for _ in 0..self.options.start_poll_iterations {
            tokio::time::sleep(self.options.start_poll_interval).await;

            if !exited {
                match child.try_wait() {
                    // still alive after the settle interval: running
                    Ok(None) => {
                        debug!(state = ?ServiceState::Running, "Startup confirmed");
                        info!(pid, "Service started");
                        // reap in the background so a later exit leaves no
                        // zombie while this process is still alive
                        std::thread::spawn(move || {
                            let _ = child.wait();
                        });
                        return Ok(pid);
                    }
                    // exited during startup: keep scanning the log, the
                    // fatal line may be flushed a moment after the exit
                    Ok(Some(status)) => {
                        debug!(%status, "Process exited during startup");
                        exited = true;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if let Some((kind, line)) = self.scan_startup_errors(log_offset) {
                debug!(state = ?ServiceState::StartFailed, %kind, "Startup rejected");
                return Err(DeployError::StartupRejected { kind, detail: line });
            }
        }

        let waited = self.options.start_poll_interval * self.options.start_poll_iterations;
        debug!(state = ?ServiceState::StartFailed, "Startup timed out");
        Err(DeployError::StartTimeout {
            waited_secs: waited.as_secs(),
            log_tail: logs::tail_lines(&self.paths.log_file(), 5),
        })
    }

    /// Stop the service. A not-running service is a no-op success that
    /// alters no files and sends no signals.
    pub async fn undeploy(&self) -> io::Result<()> {
        if !self.is_running() {
            info!("Service not running");
            return Ok(());
        }

        if let Some(pid) = self.recorded_pid() {
            info!(pid, "Stopping service");
            self.stop_pid(pid).await;
        }

        // Sweep orphans from a previous supervisor instance whose handle
        // was lost (e.g. after a crash).
        let orphans = self.probe.find_managed(&self.process_query());
        for pid in orphans {
            warn!(pid, "Terminating orphaned managed process");
            self.stop_pid(pid).await;
        }

        ManagedProcessHandle {
            pid: None,
            pid_file: self.paths.pid_file(),
        }
        .persist()?;

        info!("Service stopped");
        Ok(())
    }

    /// SIGTERM, wait out the grace period, SIGKILL only if still alive
    async fn stop_pid(&self, pid: u32) {
        if self.probe.terminate(pid).is_err() {
            // already gone: stopping a dead process is a success
            debug!(pid, "Process already exited before termination");
            return;
        }

        let deadline = tokio::time::Instant::now() + self.options.stop_grace_period;
        while tokio::time::Instant::now() < deadline {
            if !self.probe.pid_alive(pid) {
                debug!(pid, "Process exited gracefully");
                return;
            }
            tokio::time::sleep(self.options.stop_poll_interval).await;
        }

        warn!(
            pid,
            grace_secs = self.options.stop_grace_period.as_secs(),
            "Grace period exceeded, killing process"
        );
        let _ = self.probe.kill(pid);
    }

    /// Ports from the admin endpoint plus the rendered config that are
    /// already accepting connections, with their holders when resolvable
    async fn port_conflicts(&self, rendered: &str) -> Vec<PortConflict> {
        let mut ports = vec![ADMIN_PORT];
        for port in caddyfile::listen_ports(rendered) {
            if !ports.contains(&port) {
                ports.push(port);
            }
        }

        let mut conflicts = Vec::new();
        for port in ports {
            if self.endpoints.tcp_reachable("127.0.0.1", port).await {
                conflicts.push(PortConflict {
                    port,
                    holder: self.probe.port_holder(port),
                });
            }
        }
        conflicts
    }

    /// Classify fatal lines appended to the log since `offset`
    fn scan_startup_errors(&self, offset: u64) -> Option<(StartupErrorKind, String)> {
        let content = read_from_offset(&self.paths.log_file(), offset)?;
        let lines: Vec<&str> = content.lines().collect();
        let skip = lines.len().saturating_sub(STARTUP_SCAN_LINES);
        for line in &lines[skip..] {
            if let Some(kind) = StartupErrorKind::classify_line(line) {
                let detail: String = line.trim().chars().take(200).collect();
                return Some((kind, detail));
            }
        }
        None
    }

    /// Launch `caddy run --config <file> --pidfile <file>` detached from
    /// the controlling session, stdout/stderr appended to the log file
    fn spawn_detached(&self) -> io::Result<std::process::Child> {
        let log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.paths.log_file())?;
        let log_err = log.try_clone()?;

        let mut cmd = std::process::Command::new(&self.binary);
        cmd.arg("run")
            .arg("--config")
            .arg(self.paths.config_file())
            .arg("--pidfile")
            .arg(self.paths.pid_file())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // new session so the process outlives this supervisor
            unsafe {
                cmd.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        cmd.spawn()
    }
}

fn read_from_offset(path: &Path, offset: u64) -> Option<String> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = fs::File::open(path).ok()?;
    file.seek(SeekFrom::Start(offset)).ok()?;
    let mut content = String::new();
    file.read_to_string(&mut content).ok()?;
    if content.is_empty() {
        None
    } else {
        Some(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Deterministic probe: scripted liveness, records every signal
    struct FakeProbe {
        alive: Mutex<HashSet<u32>>,
        managed: Mutex<Vec<u32>>,
        terminated: Mutex<Vec<u32>>,
        killed: Mutex<Vec<u32>>,
        /// whether SIGTERM actually stops the process
        honors_terminate: bool,
    }

    impl FakeProbe {
        fn new() -> Self {
            Self {
                alive: Mutex::new(HashSet::new()),
                managed: Mutex::new(Vec::new()),
                terminated: Mutex::new(Vec::new()),
                killed: Mutex::new(Vec::new()),
                honors_terminate: true,
            }
        }

        fn with_live_pid(self, pid: u32) -> Self {
            self.alive.lock().unwrap().insert(pid);
            self
        }

        fn with_orphan(self, pid: u32) -> Self {
            self.alive.lock().unwrap().insert(pid);
            self.managed.lock().unwrap().push(pid);
            self
        }

        fn stubborn(mut self) -> Self {
            self.honors_terminate = false;
            self
        }

        fn terminated_pids(&self) -> Vec<u32> {
            self.terminated.lock().unwrap().clone()
        }

        fn killed_pids(&self) -> Vec<u32> {
            self.killed.lock().unwrap().clone()
        }
    }

    impl ProcessProbe for FakeProbe {
        fn pid_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }

        fn find_managed(&self, _query: &ProcessQuery) -> Vec<u32> {
            self.managed
                .lock()
                .unwrap()
                .iter()
                .copied()
                .filter(|pid| self.alive.lock().unwrap().contains(pid))
                .collect()
        }

        fn port_holder(&self, _port: u16) -> Option<String> {
            None
        }

        fn terminate(&self, pid: u32) -> io::Result<()> {
            if !self.alive.lock().unwrap().contains(&pid) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such process"));
            }
            self.terminated.lock().unwrap().push(pid);
            if self.honors_terminate {
                self.alive.lock().unwrap().remove(&pid);
            }
            Ok(())
        }

        fn kill(&self, pid: u32) -> io::Result<()> {
            self.killed.lock().unwrap().push(pid);
            self.alive.lock().unwrap().remove(&pid);
            Ok(())
        }
    }

    fn test_options() -> SupervisorOptions {
        SupervisorOptions {
            start_poll_iterations: 3,
            start_poll_interval: Duration::from_millis(10),
            stop_grace_period: Duration::from_millis(50),
            stop_poll_interval: Duration::from_millis(5),
        }
    }

    fn supervisor_with(dir: &Path, probe: Arc<FakeProbe>) -> Supervisor {
        Supervisor::new(
            StatePaths::new(dir),
            dir.join("caddy"),
            probe,
            EndpointChecker::new(),
            test_options(),
        )
    }

    #[test]
    fn test_recorded_pid_parses_decimal() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_with(dir.path(), Arc::new(FakeProbe::new()));

        assert_eq!(sup.recorded_pid(), None);

        fs::write(dir.path().join("caddy.pid"), "4242\n").unwrap();
        assert_eq!(sup.recorded_pid(), Some(4242));

        fs::write(dir.path().join("caddy.pid"), "garbage").unwrap();
        assert_eq!(sup.recorded_pid(), None);
    }

    #[test]
    fn test_is_running_via_recorded_pid() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(FakeProbe::new().with_live_pid(4242));
        let sup = supervisor_with(dir.path(), probe);

        fs::write(dir.path().join("caddy.pid"), "4242").unwrap();
        assert!(sup.is_running());
        assert_eq!(sup.state(), ServiceState::Running);
    }

    #[test]
    fn test_is_running_via_orphan_sweep() {
        let dir = tempfile::tempdir().unwrap();
        // no pid file at all, but a matching process exists
        let probe = Arc::new(FakeProbe::new().with_orphan(5151));
        let sup = supervisor_with(dir.path(), probe);

        assert!(sup.is_running());
    }

    #[test]
    fn test_stopped_when_recorded_pid_is_dead() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_with(dir.path(), Arc::new(FakeProbe::new()));

        fs::write(dir.path().join("caddy.pid"), "4242").unwrap();
        assert!(!sup.is_running());
        assert_eq!(sup.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_undeploy_when_stopped_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(FakeProbe::new());
        let sup = supervisor_with(dir.path(), Arc::clone(&probe));

        // stale pid file for a dead process: still a no-op success that
        // leaves the file untouched and signals nothing
        fs::write(dir.path().join("caddy.pid"), "4242").unwrap();
        sup.undeploy().await.unwrap();

        assert!(dir.path().join("caddy.pid").exists());
        assert!(probe.terminated_pids().is_empty());
        assert!(probe.killed_pids().is_empty());
    }

    #[tokio::test]
    async fn test_undeploy_graceful_exit_skips_kill() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(FakeProbe::new().with_live_pid(4242));
        let sup = supervisor_with(dir.path(), Arc::clone(&probe));

        fs::write(dir.path().join("caddy.pid"), "4242").unwrap();
        sup.undeploy().await.unwrap();

        assert_eq!(probe.terminated_pids(), vec![4242]);
        assert!(probe.killed_pids().is_empty(), "SIGKILL after a clean exit");
        assert!(!dir.path().join("caddy.pid").exists());
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_undeploy_escalates_when_terminate_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(FakeProbe::new().with_live_pid(4242).stubborn());
        let sup = supervisor_with(dir.path(), Arc::clone(&probe));

        fs::write(dir.path().join("caddy.pid"), "4242").unwrap();
        sup.undeploy().await.unwrap();

        assert_eq!(probe.terminated_pids(), vec![4242]);
        assert_eq!(probe.killed_pids(), vec![4242]);
        assert!(!dir.path().join("caddy.pid").exists());
    }

    #[tokio::test]
    async fn test_undeploy_sweeps_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(FakeProbe::new().with_orphan(6161));
        let sup = supervisor_with(dir.path(), Arc::clone(&probe));

        sup.undeploy().await.unwrap();

        assert_eq!(probe.terminated_pids(), vec![6161]);
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_deploy_without_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_with(dir.path(), Arc::new(FakeProbe::new()));

        let config = ServiceConfig::new("localhost:8080", 3000);
        let err = sup.deploy(&config).await.unwrap_err();
        assert!(matches!(err, DeployError::BinaryMissing { .. }));
    }

    #[test]
    fn test_scan_startup_errors_only_reads_past_offset() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_with(dir.path(), Arc::new(FakeProbe::new()));

        // a stale fatal line from a previous run must not classify
        fs::write(
            dir.path().join("caddy.log"),
            "Error: listen tcp :80: bind: address already in use\n",
        )
        .unwrap();
        let offset = fs::metadata(dir.path().join("caddy.log")).unwrap().len();
        assert!(sup.scan_startup_errors(offset).is_none());

        // a fresh fatal line past the offset does
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("caddy.log"))
            .unwrap();
        use std::io::Write;
        writeln!(file, "Error: listen tcp :443: bind: permission denied").unwrap();

        let (kind, detail) = sup.scan_startup_errors(offset).unwrap();
        assert_eq!(kind, StartupErrorKind::BindPermission);
        assert!(detail.contains("permission denied"));
    }

    #[test]
    fn test_process_query_uses_binary_stem() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor_with(dir.path(), Arc::new(FakeProbe::new()));
        assert_eq!(sup.process_query().image, "caddy");
    }

    #[test]
    fn test_status_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(FakeProbe::new().with_live_pid(7777));
        let sup = supervisor_with(dir.path(), probe);
        fs::write(dir.path().join("caddy.pid"), "7777").unwrap();

        let status = sup.status();
        assert!(status.running);
        assert_eq!(status.pid, Some(7777));
        assert_eq!(status.state, ServiceState::Running);
        assert!(status.config_file.ends_with("Caddyfile"));
    }
}
