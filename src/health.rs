//! Health aggregation over the managed service
//!
//! A fixed battery of independent checks, each fail-soft: a probe error
//! becomes that check's result, never an aborted report. Overall status
//! is healthy iff every required check is `Ok`; advisory checks color
//! the report but can never flip it.

use crate::caddyfile;
use crate::logs;
use crate::supervisor::Supervisor;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;

/// Log lines attached to a detailed report
const DETAILED_LOG_LINES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Unhealthy,
}

/// Outcome of one check in the battery
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub required: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl CheckResult {
    pub fn ok(required: bool, message: impl Into<String>) -> Self {
        Self::new(CheckStatus::Ok, required, message)
    }

    pub fn warning(required: bool, message: impl Into<String>) -> Self {
        Self::new(CheckStatus::Warning, required, message)
    }

    pub fn error(required: bool, message: impl Into<String>) -> Self {
        Self::new(CheckStatus::Error, required, message)
    }

    pub fn info(required: bool, message: impl Into<String>) -> Self {
        Self::new(CheckStatus::Info, required, message)
    }

    fn new(status: CheckStatus, required: bool, message: impl Into<String>) -> Self {
        Self {
            status,
            required,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Static environment facts attached to a detailed report
#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub platform: String,
    pub caddy_path: String,
    pub config_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub timestamp: String,
    pub overall_status: OverallStatus,
    pub checks: BTreeMap<&'static str, CheckResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemInfo>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.overall_status == OverallStatus::Healthy
    }
}

/// Healthy iff every required check is `Ok`
pub fn overall_status(checks: &BTreeMap<&'static str, CheckResult>) -> OverallStatus {
    let all_required_ok = checks
        .values()
        .filter(|check| check.required)
        .all(|check| check.status == CheckStatus::Ok);
    if all_required_ok {
        OverallStatus::Healthy
    } else {
        OverallStatus::Unhealthy
    }
}

/// Run the full battery sequentially and aggregate
pub async fn run(sup: &Supervisor, detailed: bool) -> HealthReport {
    let mut checks = BTreeMap::new();
    checks.insert("process", check_process(sup));
    checks.insert("config", check_config(sup).await);
    checks.insert("ports", check_ports(sup).await);
    checks.insert("frontend", check_frontend(sup).await);
    checks.insert("backend", check_backend(sup).await);
    checks.insert("tls", check_tls(sup).await);

    let overall = overall_status(&checks);

    let (log_tail, system) = if detailed {
        (
            Some(logs::tail_lines(&sup.paths().log_file(), DETAILED_LOG_LINES)),
            Some(system_info(sup)),
        )
    } else {
        (None, None)
    };

    HealthReport {
        timestamp: chrono::Utc::now().to_rfc3339(),
        overall_status: overall,
        checks,
        logs: log_tail,
        system,
    }
}

fn check_process(sup: &Supervisor) -> CheckResult {
    if sup.is_running() {
        let mut result = CheckResult::ok(true, "service process is running");
        if let Some(pid) = sup.recorded_pid() {
            result = result.with_detail(json!({ "pid": pid }));
        }
        result
    } else {
        CheckResult::error(true, "service process is not running")
    }
}

async fn check_config(sup: &Supervisor) -> CheckResult {
    let config_file = sup.paths().config_file();
    if !config_file.exists() {
        return CheckResult::error(true, "configuration file does not exist");
    }

    match sup.validate_config().await {
        Ok(()) => CheckResult::ok(true, "configuration is valid")
            .with_detail(json!({ "path": config_file.display().to_string() })),
        Err(e) => CheckResult::error(true, format!("configuration validation failed: {e}")),
    }
}

async fn check_ports(sup: &Supervisor) -> CheckResult {
    let content = match fs::read_to_string(sup.paths().config_file()) {
        Ok(content) => content,
        Err(e) => return CheckResult::error(true, format!("cannot read configuration: {e}")),
    };

    let mut listening = Vec::new();
    for port in caddyfile::listen_ports(&content) {
        if sup.endpoints().tcp_reachable("127.0.0.1", port).await {
            listening.push(port);
        }
    }

    if listening.is_empty() {
        CheckResult::error(true, "no listen port is accepting connections")
    } else {
        CheckResult::ok(true, format!("listening on {listening:?}"))
            .with_detail(json!({ "listening_ports": listening }))
    }
}

async fn check_frontend(sup: &Supervisor) -> CheckResult {
    let content = match fs::read_to_string(sup.paths().config_file()) {
        Ok(content) => content,
        Err(e) => return CheckResult::error(true, format!("cannot read configuration: {e}")),
    };

    let endpoints = caddyfile::frontend_endpoints(&content);
    if endpoints.is_empty() {
        return CheckResult::error(true, "no frontend endpoint configured");
    }

    let mut probes = Vec::new();
    for endpoint in &endpoints {
        probes.push(sup.endpoints().http_probe(endpoint).await);
    }

    let reachable = probes.iter().filter(|probe| probe.success).count();
    let total = probes.len();
    let detail = json!({ "probes": probes });
    if reachable > 0 {
        CheckResult::ok(true, format!("frontend reachable ({reachable}/{total})"))
            .with_detail(detail)
    } else {
        CheckResult::error(true, "no frontend endpoint answered").with_detail(detail)
    }
}

async fn check_backend(sup: &Supervisor) -> CheckResult {
    let content = match fs::read_to_string(sup.paths().config_file()) {
        Ok(content) => content,
        // advisory check: a missing config is already the config check's problem
        Err(e) => return CheckResult::warning(false, format!("cannot read configuration: {e}")),
    };

    let backends = caddyfile::backend_endpoints(&content);
    if backends.is_empty() {
        return CheckResult::info(false, "no backend configured");
    }

    let mut reachable = Vec::new();
    let mut unreachable = Vec::new();
    for backend in &backends {
        let ok = match backend.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => sup.endpoints().tcp_reachable(host, port).await,
                Err(_) => false,
            },
            None => false,
        };
        if ok {
            reachable.push(backend.clone());
        } else {
            unreachable.push(backend.clone());
        }
    }

    let total = backends.len();
    let down = unreachable.len();
    let detail = json!({ "reachable": reachable, "unreachable": unreachable });
    if down == 0 {
        CheckResult::ok(false, format!("all {total} backend(s) reachable")).with_detail(detail)
    } else {
        // backends may start independently of the proxy
        CheckResult::warning(false, format!("{down} of {total} backend(s) unreachable"))
            .with_detail(detail)
    }
}

async fn check_tls(sup: &Supervisor) -> CheckResult {
    let content = match fs::read_to_string(sup.paths().config_file()) {
        Ok(content) => content,
        Err(e) => return CheckResult::info(false, format!("cannot read configuration: {e}")),
    };

    let endpoints = caddyfile::https_endpoints(&content);
    if endpoints.is_empty() {
        return CheckResult::info(false, "HTTPS not configured");
    }

    let mut certificates = Vec::new();
    for endpoint in &endpoints {
        certificates.push(sup.endpoints().certificate_status(endpoint).await);
    }

    let valid = certificates.iter().filter(|cert| cert.valid).count();
    let total = certificates.len();
    let detail = json!({ "certificates": certificates });
    if valid == total {
        CheckResult::ok(false, "TLS certificates are valid").with_detail(detail)
    } else {
        CheckResult::warning(
            false,
            format!("{} of {total} certificate(s) invalid or unreachable", total - valid),
        )
        .with_detail(detail)
    }
}

fn system_info(sup: &Supervisor) -> SystemInfo {
    let uptime_secs = fs::metadata(sup.paths().pid_file())
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(|elapsed| elapsed.as_secs());

    SystemInfo {
        platform: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
        caddy_path: sup.binary().display().to_string(),
        config_dir: sup.paths().state_dir().display().to_string(),
        uptime_secs,
    }
}
