//! Read-only diagnostics: a detailed health check plus canned advice
//!
//! No decision logic and no state changes; failures map to fixed
//! human-readable recommendations.

use crate::health::{self, CheckStatus, HealthReport};
use crate::supervisor::Supervisor;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Diagnosis {
    pub timestamp: String,
    pub health: HealthReport,
    pub recommendations: Vec<String>,
}

pub async fn run(sup: &Supervisor) -> Diagnosis {
    let report = health::run(sup, true).await;
    let recommendations = recommendations_for(&report);
    Diagnosis {
        timestamp: chrono::Utc::now().to_rfc3339(),
        health: report,
        recommendations,
    }
}

/// Fixed lookup from check failures to advice
pub fn recommendations_for(report: &HealthReport) -> Vec<String> {
    let mut recommendations = Vec::new();

    let status_of = |name: &str| report.checks.get(name).map(|check| check.status);

    if matches!(status_of("process"), Some(status) if status != CheckStatus::Ok) {
        recommendations
            .push("Check that the service started correctly (`caddyctl logs`)".to_string());
    }
    if matches!(status_of("config"), Some(status) if status != CheckStatus::Ok) {
        recommendations.push(
            "Check the Caddyfile syntax (`caddy validate --config ~/.caddy/Caddyfile`)"
                .to_string(),
        );
    }
    if matches!(status_of("backend"), Some(CheckStatus::Warning | CheckStatus::Error)) {
        recommendations
            .push("Check that the backend service is running and reachable".to_string());
    }
    if matches!(status_of("tls"), Some(CheckStatus::Warning)) {
        recommendations.push("Check the TLS certificate status and expiry".to_string());
    }

    recommendations
}
