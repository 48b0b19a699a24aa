//! Caddyfile rendering and inspection
//!
//! The configuration document is regenerated wholesale on every deploy,
//! never patched in place. Rendering is a pure function of the typed
//! inputs; the extraction helpers recover listen ports and endpoints from
//! rendered text for the health battery.

use std::path::Path;

/// Typed inputs for one rendered configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Site address: `host[:port]` or a bare domain
    pub listen_spec: String,
    /// Upstream host the site proxies to
    pub backend_host: String,
    /// Upstream port the site proxies to
    pub backend_port: u16,
    /// Whether the operator asked for HTTPS (informational; the variant
    /// selection below is driven by the listen spec alone)
    pub tls_enabled: bool,
    /// Verbatim replacement for the rendered document
    pub raw_override: Option<String>,
}

impl ServiceConfig {
    pub fn new(listen_spec: impl Into<String>, backend_port: u16) -> Self {
        Self {
            listen_spec: listen_spec.into(),
            backend_host: default_backend_host(),
            backend_port,
            tls_enabled: false,
            raw_override: None,
        }
    }

    pub fn with_backend_host(mut self, host: impl Into<String>) -> Self {
        self.backend_host = host.into();
        self
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        self
    }

    pub fn with_raw_override(mut self, raw: impl Into<String>) -> Self {
        self.raw_override = Some(raw.into());
        self
    }

    /// Scheme for the public URL reported after a deploy
    pub fn public_scheme(&self) -> &'static str {
        if self.tls_enabled && ListenClass::of(&self.listen_spec) == ListenClass::Public {
            "https"
        } else {
            "http"
        }
    }
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

/// Which of the three canned profiles a listen spec selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenClass {
    /// Loopback or wildcard development address
    Local,
    /// Non-local address pinned to plain HTTP on port 80
    HttpOnly,
    /// Public HTTPS-capable domain
    Public,
}

impl ListenClass {
    /// Pure function of the listen-spec string (prefix/substring matching)
    pub fn of(spec: &str) -> Self {
        let is_local = spec.starts_with("localhost")
            || spec.starts_with("127.")
            || spec.starts_with("0.0.0.0")
            || spec
                .split_once(':')
                .map(|(host, _)| matches!(host, "localhost" | "127.0.0.1" | "0.0.0.0"))
                .unwrap_or(false);

        if is_local {
            ListenClass::Local
        } else if spec.contains(":80") {
            ListenClass::HttpOnly
        } else {
            ListenClass::Public
        }
    }
}

/// Render the configuration document for `config`, writing access logs
/// under `state_dir`. Returns `raw_override` verbatim when set.
pub fn render(config: &ServiceConfig, state_dir: &Path) -> String {
    if let Some(ref raw) = config.raw_override {
        return raw.clone();
    }

    let access_log = state_dir.join("access.log");
    let access_log = access_log.display();
    let site = &config.listen_spec;
    let upstream = format!("{}:{}", config.backend_host, config.backend_port);

    match ListenClass::of(site) {
        ListenClass::Local => format!(
            r#"{site} {{
    reverse_proxy {upstream} {{
        # streaming responses (SSE)
        flush_interval -1

        transport http {{
            read_timeout 300s
            write_timeout 300s
            dial_timeout 30s
        }}
    }}

    header {{
        X-Frame-Options "SAMEORIGIN"
        X-Content-Type-Options "nosniff"
        -Server
    }}

    log {{
        output file {access_log} {{
            roll_size 100mb
            roll_keep 3
        }}
    }}
}}
"#
        ),
        ListenClass::HttpOnly => format!(
            r#"{site} {{
    reverse_proxy {upstream} {{
        # streaming responses (SSE)
        flush_interval -1

        transport http {{
            read_timeout 300s
            write_timeout 300s
            dial_timeout 30s
        }}
    }}

    # no HSTS on plain HTTP
    header {{
        X-Frame-Options "DENY"
        X-Content-Type-Options "nosniff"
        Referrer-Policy "strict-origin-when-cross-origin"
        -Server
    }}

    log {{
        output file {access_log} {{
            roll_size 100mb
            roll_keep 5
        }}
    }}
}}
"#
        ),
        ListenClass::Public => format!(
            r#"{site} {{
    reverse_proxy {upstream} {{
        # streaming responses (SSE)
        flush_interval -1

        transport http {{
            read_timeout 300s
            write_timeout 300s
            dial_timeout 30s
        }}
    }}

    header {{
        Strict-Transport-Security "max-age=31536000; includeSubDomains"
        X-Frame-Options "DENY"
        X-Content-Type-Options "nosniff"
        Referrer-Policy "strict-origin-when-cross-origin"
        -Server
    }}

    log {{
        output file {access_log} {{
            roll_size 100mb
            roll_keep 5
        }}
    }}
}}
"#
        ),
    }
}

/// Site addresses: the token before `{` on each top-level block header
pub fn site_addresses(content: &str) -> Vec<String> {
    let mut addresses = Vec::new();
    let mut depth: i32 = 0;

    for line in content.lines() {
        let trimmed = line.trim();
        if depth == 0 && trimmed.ends_with('{') && trimmed.len() > 1 {
            if let Some(address) = trimmed.trim_end_matches('{').trim().split_whitespace().next() {
                addresses.push(address.to_string());
            }
        }
        depth += trimmed.matches('{').count() as i32;
        depth -= trimmed.matches('}').count() as i32;
    }

    addresses
}

/// Listen ports implied by the configuration. Falls back to 80 for local
/// documents and 80 + 443 for public ones when no port is spelled out.
pub fn listen_ports(content: &str) -> Vec<u16> {
    let mut ports: Vec<u16> = site_addresses(content)
        .iter()
        .filter_map(|address| {
            address
                .rsplit_once(':')
                .and_then(|(_, port)| port.parse::<u16>().ok())
        })
        .collect();

    if ports.is_empty() {
        let is_local = content.contains("localhost")
            || content.contains("127.0.0.1")
            || content.contains("0.0.0.0");
        ports = if is_local { vec![80] } else { vec![80, 443] };
    }

    ports.sort_unstable();
    ports.dedup();
    ports
}

/// Map each site address to the URL a client would use to reach it
pub fn frontend_endpoints(content: &str) -> Vec<String> {
    site_addresses(content)
        .iter()
        .map(|address| {
            if let Some(port) = address.strip_prefix(':') {
                format!("http://localhost:{port}")
            } else if address.contains(':') {
                let local = address.starts_with("localhost") || address.contains("127.0.0.1");
                if local {
                    format!("http://{address}")
                } else {
                    format!("https://{address}")
                }
            } else if address == "localhost"
                || address.starts_with("127.")
                || address.ends_with(".local")
            {
                format!("http://{address}")
            } else {
                format!("https://{address}")
            }
        })
        .collect()
}

/// Upstream `host:port` targets of every `reverse_proxy` directive
pub fn backend_endpoints(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            let rest = trimmed.strip_prefix("reverse_proxy")?;
            rest.split_whitespace()
                .next()
                .filter(|target| *target != "{")
                .map(|target| target.to_string())
        })
        .collect()
}

/// Frontend endpoints served over HTTPS
pub fn https_endpoints(content: &str) -> Vec<String> {
    frontend_endpoints(content)
        .into_iter()
        .filter(|endpoint| endpoint.starts_with("https://"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn state_dir() -> PathBuf {
        PathBuf::from("/home/op/.caddy")
    }

    #[test]
    fn test_listen_class_local_prefixes() {
        assert_eq!(ListenClass::of("localhost"), ListenClass::Local);
        assert_eq!(ListenClass::of("localhost:8080"), ListenClass::Local);
        assert_eq!(ListenClass::of("127.0.0.1:3000"), ListenClass::Local);
        assert_eq!(ListenClass::of("127.1.2.3"), ListenClass::Local);
        assert_eq!(ListenClass::of("0.0.0.0:80"), ListenClass::Local);
    }

    #[test]
    fn test_listen_class_http_only() {
        assert_eq!(ListenClass::of("example.com:80"), ListenClass::HttpOnly);
        assert_eq!(ListenClass::of(":80"), ListenClass::HttpOnly);
    }

    #[test]
    fn test_listen_class_public() {
        assert_eq!(ListenClass::of("example.com"), ListenClass::Public);
        assert_eq!(ListenClass::of("example.com:8443"), ListenClass::Public);
    }

    #[test]
    fn test_local_render_omits_hsts() {
        let config = ServiceConfig::new("localhost:8080", 3000);
        let rendered = render(&config, &state_dir());

        assert!(rendered.starts_with("localhost:8080 {"));
        assert!(rendered.contains("reverse_proxy 127.0.0.1:3000"));
        assert!(rendered.contains(r#"X-Frame-Options "SAMEORIGIN""#));
        assert!(!rendered.contains("Strict-Transport-Security"));
        assert!(rendered.contains("roll_keep 3"));
    }

    #[test]
    fn test_http_only_render_omits_hsts_with_production_headers() {
        let config = ServiceConfig::new("example.com:80", 3000);
        let rendered = render(&config, &state_dir());

        assert!(!rendered.contains("Strict-Transport-Security"));
        assert!(rendered.contains(r#"X-Frame-Options "DENY""#));
        assert!(rendered.contains(r#"Referrer-Policy "strict-origin-when-cross-origin""#));
        assert!(rendered.contains("roll_keep 5"));
    }

    #[test]
    fn test_public_render_includes_hsts() {
        let config = ServiceConfig::new("example.com", 8080).with_tls(true);
        let rendered = render(&config, &state_dir());

        assert!(rendered
            .contains(r#"Strict-Transport-Security "max-age=31536000; includeSubDomains""#));
        assert!(rendered.contains("reverse_proxy 127.0.0.1:8080"));
    }

    #[test]
    fn test_render_custom_backend_host() {
        let config = ServiceConfig::new("localhost", 9000).with_backend_host("10.0.0.5");
        let rendered = render(&config, &state_dir());

        assert!(rendered.contains("reverse_proxy 10.0.0.5:9000"));
    }

    #[test]
    fn test_raw_override_is_verbatim() {
        let raw = "example.com {\n    respond \"ok\"\n}\n";
        let config = ServiceConfig::new("ignored", 1).with_raw_override(raw);

        assert_eq!(render(&config, &state_dir()), raw);
    }

    #[test]
    fn test_access_log_lives_in_state_dir() {
        let config = ServiceConfig::new("localhost", 3000);
        let rendered = render(&config, &state_dir());

        assert!(rendered.contains("/home/op/.caddy/access.log"));
    }

    #[test]
    fn test_site_addresses_skip_nested_blocks() {
        let config = ServiceConfig::new("localhost:8080", 3000);
        let rendered = render(&config, &state_dir());

        // only the site header, not reverse_proxy/transport/header/log blocks
        assert_eq!(site_addresses(&rendered), vec!["localhost:8080"]);
    }

    #[test]
    fn test_listen_ports_from_explicit_port() {
        let rendered = render(&ServiceConfig::new("localhost:8080", 3000), &state_dir());
        assert_eq!(listen_ports(&rendered), vec![8080]);

        let rendered = render(&ServiceConfig::new(":80", 3000), &state_dir());
        assert_eq!(listen_ports(&rendered), vec![80]);
    }

    #[test]
    fn test_listen_ports_default_local() {
        let rendered = render(&ServiceConfig::new("localhost", 3000), &state_dir());
        assert_eq!(listen_ports(&rendered), vec![80]);
    }

    #[test]
    fn test_listen_ports_default_public() {
        let content = "example.com {\n    reverse_proxy 10.0.0.5:3000\n}\n";
        assert_eq!(listen_ports(content), vec![80, 443]);
    }

    #[test]
    fn test_frontend_endpoints_schemes() {
        assert_eq!(
            frontend_endpoints("localhost:8080 {\n}\n"),
            vec!["http://localhost:8080"]
        );
        assert_eq!(
            frontend_endpoints(":80 {\n}\n"),
            vec!["http://localhost:80"]
        );
        assert_eq!(
            frontend_endpoints("example.com {\n}\n"),
            vec!["https://example.com"]
        );
        assert_eq!(
            frontend_endpoints("example.com:8443 {\n}\n"),
            vec!["https://example.com:8443"]
        );
    }

    #[test]
    fn test_backend_endpoints_extraction() {
        let rendered = render(&ServiceConfig::new("localhost:80", 3000), &state_dir());
        assert_eq!(backend_endpoints(&rendered), vec!["127.0.0.1:3000"]);
    }

    #[test]
    fn test_https_endpoints_filter() {
        let content = "example.com {\n}\nlocalhost:8080 {\n}\n";
        assert_eq!(https_endpoints(content), vec!["https://example.com"]);
    }

    #[test]
    fn test_localhost_port_80_deploy_profile() {
        let config = ServiceConfig::new("localhost:80", 3000);
        let rendered = render(&config, &state_dir());

        assert!(rendered.contains("reverse_proxy 127.0.0.1:3000"));
        assert!(rendered.contains(r#"X-Frame-Options "SAMEORIGIN""#));
        assert!(!rendered.contains("Strict-Transport-Security"));
        assert_eq!(listen_ports(&rendered), vec![80]);
    }
}
