//! Post-deploy DNS guidance for public domains
//!
//! Advisory only: every failure here is a warning and never blocks the
//! deploy that triggered it.

use std::net::IpAddr;
use std::time::Duration;
use tracing::{info, warn};

const IP_SERVICES: &[&str] = &[
    "https://ipinfo.io/ip",
    "https://api.ipify.org",
    "https://checkip.amazonaws.com",
    "https://icanhazip.com",
];

/// Compare the domain's A record against this server's public address
/// and log either a confirmation or setup instructions
pub async fn post_deploy_check(listen_spec: &str) {
    let domain = clean_domain(listen_spec);
    if is_local_domain(&domain) {
        return;
    }

    let server_ip = match public_ip().await {
        Some(ip) => ip,
        None => {
            warn!("Cannot determine the server's public IP, skipping DNS check");
            return;
        }
    };

    let resolved = resolve(&domain).await;
    info!(%domain, %server_ip, "DNS configuration check");

    match resolved {
        Some(ip) if ip.to_string() == server_ip => {
            info!(%ip, "Domain resolves to this server; certificates will be provisioned automatically");
        }
        Some(ip) => {
            warn!(resolved = %ip, expected = %server_ip, "Domain resolves to a different address");
            log_setup_instructions(&domain, &server_ip);
        }
        None => {
            warn!(%domain, "Domain has no DNS record yet");
            log_setup_instructions(&domain, &server_ip);
        }
    }
}

/// Strip port and scheme so `example.com:8443` checks `example.com`
fn clean_domain(listen_spec: &str) -> String {
    let spec = listen_spec
        .strip_prefix("https://")
        .or_else(|| listen_spec.strip_prefix("http://"))
        .unwrap_or(listen_spec);
    match spec.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => spec.to_string(),
    }
}

fn is_local_domain(domain: &str) -> bool {
    domain.is_empty()
        || domain == "localhost"
        || domain == "0.0.0.0"
        || domain.starts_with("127.")
}

async fn public_ip() -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .ok()?;

    for service in IP_SERVICES {
        let response = match client.get(*service).send().await {
            Ok(response) => response,
            Err(_) => continue,
        };
        let body = match response.text().await {
            Ok(body) => body,
            Err(_) => continue,
        };
        let candidate = body.trim();
        if candidate.parse::<IpAddr>().is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

async fn resolve(domain: &str) -> Option<IpAddr> {
    let addrs = tokio::net::lookup_host((domain, 80)).await.ok()?;
    addrs.map(|addr| addr.ip()).find(|ip| ip.is_ipv4())
}

fn log_setup_instructions(domain: &str, server_ip: &str) {
    info!("To point {domain} at this server, add a DNS record:");
    info!("  type: A, host: @ (or empty), value: {server_ip}, TTL: 600");
    info!("Propagation usually takes 5-10 minutes; verify with `nslookup {domain}`");
    info!("Once propagated, HTTPS and the HTTP->HTTPS redirect come up automatically");
    info!("Then reach the site at https://{domain}");
}
