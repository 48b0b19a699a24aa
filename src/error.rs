//! Error taxonomy for the deploy path and startup-failure classification

use serde::Serialize;
use thiserror::Error;

/// Classified reason for a startup rejection, scraped from the log tail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupErrorKind {
    /// A listen port is already bound, or binding it failed outright
    PortInUse,
    /// Binding a privileged port was denied
    BindPermission,
    /// The configuration was rejected at runtime
    ConfigError,
    /// A fatal log line that matched none of the known patterns
    Unclassified,
}

impl StartupErrorKind {
    /// Short machine-readable label used in log fields and JSON output
    pub fn as_str(&self) -> &'static str {
        match self {
            StartupErrorKind::PortInUse => "port_in_use",
            StartupErrorKind::BindPermission => "bind_permission",
            StartupErrorKind::ConfigError => "config_error",
            StartupErrorKind::Unclassified => "unclassified",
        }
    }

    /// Canned remediation text shown to the operator alongside the failure
    pub fn remediation(&self) -> &'static str {
        match self {
            StartupErrorKind::PortInUse => {
                "Stop the conflicting service (`caddyctl undeploy`), inspect the \
                 port holder (`ss -tlnp`), or deploy with a different listen address"
            }
            StartupErrorKind::BindPermission => {
                "Run with elevated privileges to bind ports below 1024, or deploy \
                 with an unprivileged listen port"
            }
            StartupErrorKind::ConfigError => {
                "Validate the generated Caddyfile (`caddy validate --config \
                 ~/.caddy/Caddyfile`) and check the deploy arguments"
            }
            StartupErrorKind::Unclassified => {
                "Inspect the service log (`caddyctl logs`) for the full error"
            }
        }
    }

    /// Classify a single log line. Returns `None` for non-fatal lines.
    pub fn classify_line(line: &str) -> Option<Self> {
        let line = line.to_lowercase();
        if !line.contains("error") && !line.contains("failed") && !line.contains("fatal") {
            return None;
        }
        if line.contains("address already in use") {
            Some(StartupErrorKind::PortInUse)
        } else if line.contains("permission denied") {
            Some(StartupErrorKind::BindPermission)
        } else if line.contains("bind") && line.contains("address") {
            Some(StartupErrorKind::PortInUse)
        } else if line.contains("config") {
            Some(StartupErrorKind::ConfigError)
        } else {
            Some(StartupErrorKind::Unclassified)
        }
    }
}

impl std::fmt::Display for StartupErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that abort a deploy. Port conflicts are deliberately absent:
/// they are advisory warnings, never failures.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The rendered configuration failed external validation
    #[error("configuration rejected by the caddy validator: {detail}")]
    ConfigInvalid { detail: String },

    /// The managed binary is not installed where expected
    #[error("caddy binary not found at {path} (run `caddyctl install`)")]
    BinaryMissing { path: String },

    /// The process died during startup with a classified reason
    #[error("service rejected startup ({kind}): {detail}")]
    StartupRejected {
        kind: StartupErrorKind,
        detail: String,
    },

    /// The process neither came up nor logged a fatal error within the bound
    #[error("service did not come up within {waited_secs}s")]
    StartTimeout {
        waited_secs: u64,
        log_tail: Vec<String>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Remediation hint for the operator, when one exists
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            DeployError::ConfigInvalid { .. } => {
                Some(StartupErrorKind::ConfigError.remediation())
            }
            DeployError::BinaryMissing { .. } => {
                Some("Run `caddyctl install` to download the latest caddy release")
            }
            DeployError::StartupRejected { kind, .. } => Some(kind.remediation()),
            DeployError::StartTimeout { .. } => {
                Some("Inspect the service log (`caddyctl logs`) for slow or hung startup")
            }
            DeployError::Io(_) => None,
        }
    }
}
