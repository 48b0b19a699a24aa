//! caddyctl - command-line interface for managing a Caddy reverse proxy
//!
//! Usage:
//!   caddyctl deploy --port <port> [--domain <spec>] [--backend-host <host>]
//!                   [--ssl] [--config <file>] [--install] [--force-install]
//!   caddyctl undeploy             Stop the managed service
//!   caddyctl status               Show service status
//!   caddyctl health-check [--detailed] [--json]
//!   caddyctl logs [--follow] [--lines N]
//!   caddyctl diagnose [--json]
//!   caddyctl install [--force]    Download the caddy binary

use anyhow::{bail, Context, Result};
use caddyctl::caddyfile::ServiceConfig;
use caddyctl::endpoint::EndpointChecker;
use caddyctl::health::{CheckStatus, HealthReport};
use caddyctl::install::{self, Installer};
use caddyctl::supervisor::{StatePaths, Supervisor, SupervisorOptions};
use caddyctl::{diagnose, dns, health, logs, probe, PKG_NAME, VERSION};
use std::env;
use std::path::PathBuf;
use tracing::{error, info};

const DEFAULT_DOMAIN: &str = "localhost:80";
const DEFAULT_LOG_LINES: usize = 20;

#[derive(Debug)]
enum Command {
    Deploy(DeployOptions),
    Undeploy,
    Status,
    HealthCheck { detailed: bool, json: bool },
    Logs { follow: bool, lines: usize },
    Diagnose { json: bool },
    Install { force: bool },
    Help,
    Version,
}

#[derive(Debug)]
struct DeployOptions {
    domain: String,
    backend_port: u16,
    backend_host: String,
    ssl: bool,
    config: Option<PathBuf>,
    install: bool,
    force_install: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("caddyctl=info".parse().expect("valid log directive")),
        )
        .with_target(false)
        .init();

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(1);
    }

    let command = parse_command(&args[1..])?;

    match command {
        Command::Help => {
            print_help();
            Ok(0)
        }
        Command::Version => {
            println!("{PKG_NAME} {VERSION}");
            Ok(0)
        }
        Command::Deploy(opts) => handle_deploy(opts).await,
        Command::Undeploy => handle_undeploy().await,
        Command::Status => handle_status(),
        Command::HealthCheck { detailed, json } => handle_health_check(detailed, json).await,
        Command::Logs { follow, lines } => handle_logs(follow, lines).await,
        Command::Diagnose { json } => handle_diagnose(json).await,
        Command::Install { force } => handle_install(force).await,
    }
}

fn parse_command(args: &[String]) -> Result<Command> {
    match args[0].as_str() {
        "help" | "--help" | "-h" => Ok(Command::Help),
        "version" | "--version" | "-V" => Ok(Command::Version),
        "deploy" => parse_deploy(&args[1..]),
        "undeploy" | "stop" => Ok(Command::Undeploy),
        "status" => Ok(Command::Status),
        "health-check" | "health" => {
            let detailed = has_flag(&args[1..], &["--detailed", "-v"]);
            let json = has_flag(&args[1..], &["--json"]);
            Ok(Command::HealthCheck { detailed, json })
        }
        "logs" | "log" => {
            let follow = has_flag(&args[1..], &["--follow", "-f"]);
            let lines = flag_value(&args[1..], &["--lines", "-n"])?
                .map(|value| value.parse::<usize>().context("--lines expects a number"))
                .transpose()?
                .unwrap_or(DEFAULT_LOG_LINES);
            Ok(Command::Logs { follow, lines })
        }
        "diagnose" => Ok(Command::Diagnose {
            json: has_flag(&args[1..], &["--json"]),
        }),
        "install" => Ok(Command::Install {
            force: has_flag(&args[1..], &["--force"]),
        }),
        other => bail!("unknown command: {other} (see `caddyctl help`)"),
    }
}

fn parse_deploy(args: &[String]) -> Result<Command> {
    let domain = flag_value(args, &["--domain", "-d"])?.unwrap_or_else(|| DEFAULT_DOMAIN.to_string());
    let backend_port = flag_value(args, &["--port", "-p"])?
        .context("deploy requires --port <backend port>")?
        .parse::<u16>()
        .context("--port expects a port number")?;
    let backend_host =
        flag_value(args, &["--backend-host"])?.unwrap_or_else(|| "127.0.0.1".to_string());
    let config = flag_value(args, &["--config", "-c"])?.map(PathBuf::from);

    Ok(Command::Deploy(DeployOptions {
        domain,
        backend_port,
        backend_host,
        ssl: has_flag(args, &["--ssl"]),
        config,
        install: has_flag(args, &["--install"]),
        force_install: has_flag(args, &["--force-install"]),
    }))
}

fn has_flag(args: &[String], names: &[&str]) -> bool {
    args.iter().any(|arg| names.contains(&arg.as_str()))
}

fn flag_value(args: &[String], names: &[&str]) -> Result<Option<String>> {
    for (i, arg) in args.iter().enumerate() {
        if names.contains(&arg.as_str()) {
            return match args.get(i + 1) {
                Some(value) if !value.starts_with('-') => Ok(Some(value.clone())),
                _ => bail!("{arg} expects a value"),
            };
        }
    }
    Ok(None)
}

/// Build the supervisor from its explicit inputs: state directory,
/// binary path, native probe, endpoint checker and default timings
fn build_supervisor() -> Result<Supervisor> {
    let state_dir = dirs_next::home_dir()
        .map(|home| home.join(".caddy"))
        .unwrap_or_else(|| PathBuf::from(".caddy"));
    let paths = StatePaths::new(state_dir);
    paths.ensure_exists().context("cannot create state directory")?;

    Ok(Supervisor::new(
        paths,
        install::default_binary_path(),
        probe::native(),
        EndpointChecker::new(),
        SupervisorOptions::default(),
    ))
}

async fn handle_deploy(opts: DeployOptions) -> Result<i32> {
    let sup = build_supervisor()?;

    if opts.force_install || (opts.install && !sup.binary().exists()) {
        let installer = Installer::new(sup.binary().to_path_buf());
        installer.install(opts.force_install).await?;
    } else if !sup.binary().exists() {
        eprintln!("caddy not found at {}", sup.binary().display());
        eprintln!("Run with --install to download it, or install caddy manually");
        return Ok(1);
    }

    let mut config = ServiceConfig::new(opts.domain.clone(), opts.backend_port)
        .with_backend_host(opts.backend_host)
        .with_tls(opts.ssl);
    if let Some(ref path) = opts.config {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config override {}", path.display()))?;
        config = config.with_raw_override(raw);
    }

    match sup.deploy(&config).await {
        Ok(pid) => {
            info!(pid, "Deployment succeeded");
            println!(
                "Service deployed: {}://{}",
                config.public_scheme(),
                opts.domain
            );
            dns::post_deploy_check(&opts.domain).await;
            Ok(0)
        }
        Err(e) => {
            error!(error = %e, "Deployment failed");
            if let Some(hint) = e.remediation() {
                eprintln!("Hint: {hint}");
            }
            Ok(1)
        }
    }
}

async fn handle_undeploy() -> Result<i32> {
    let sup = build_supervisor()?;
    sup.undeploy().await.context("failed to stop the service")?;
    println!("Service stopped");
    Ok(0)
}

fn handle_status() -> Result<i32> {
    let sup = build_supervisor()?;
    let status = sup.status();

    println!("Service status");
    println!(
        "  running:     {}",
        if status.running { "yes" } else { "no" }
    );
    if let Some(pid) = status.pid {
        println!("  pid:         {pid}");
    }
    println!("  caddy:       {}", status.caddy_path);
    println!("  config file: {}", status.config_file);
    println!("  pid file:    {}", status.pid_file);
    println!("  log file:    {}", status.log_file);
    Ok(0)
}

async fn handle_health_check(detailed: bool, json: bool) -> Result<i32> {
    let sup = build_supervisor()?;
    let report = health::run(&sup, detailed).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_health_report(&report, detailed);
    }

    Ok(if report.is_healthy() { 0 } else { 1 })
}

async fn handle_logs(follow: bool, lines: usize) -> Result<i32> {
    let sup = build_supervisor()?;
    let log_file = sup.paths().log_file();

    if !log_file.exists() {
        println!("No log file yet at {}", log_file.display());
        return Ok(0);
    }

    if follow {
        logs::follow(&log_file, lines).await?;
    } else {
        for line in logs::tail_lines(&log_file, lines) {
            println!("{line}");
        }
    }
    Ok(0)
}

async fn handle_diagnose(json: bool) -> Result<i32> {
    let sup = build_supervisor()?;
    let diagnosis = diagnose::run(&sup).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&diagnosis)?);
    } else {
        println!("Diagnostic report ({})", diagnosis.timestamp);
        print_health_report(&diagnosis.health, true);
        if !diagnosis.recommendations.is_empty() {
            println!();
            println!("Recommendations:");
            for (i, recommendation) in diagnosis.recommendations.iter().enumerate() {
                println!("  {}. {recommendation}", i + 1);
            }
        }
    }

    Ok(if diagnosis.health.is_healthy() { 0 } else { 1 })
}

async fn handle_install(force: bool) -> Result<i32> {
    let installer = Installer::new(install::default_binary_path());
    installer.install(force).await?;
    println!("caddy installed at {}", installer.target().display());
    Ok(0)
}

fn print_health_report(report: &HealthReport, detailed: bool) {
    println!("Health: {:?}", report.overall_status);
    println!("  checked at {}", report.timestamp);
    for (name, check) in &report.checks {
        let marker = match check.status {
            CheckStatus::Ok => "ok",
            CheckStatus::Warning => "warn",
            CheckStatus::Error => "fail",
            CheckStatus::Info => "info",
        };
        let advisory = if check.required { "" } else { " (advisory)" };
        println!("  [{marker:>4}] {name}: {}{advisory}", check.message);
    }

    if detailed {
        if let Some(ref system) = report.system {
            println!();
            println!("System:");
            println!("  platform: {}", system.platform);
            println!("  caddy:    {}", system.caddy_path);
            println!("  state:    {}", system.config_dir);
            if let Some(uptime) = system.uptime_secs {
                println!("  uptime:   {uptime}s");
            }
        }
        if let Some(ref log_tail) = report.logs {
            if !log_tail.is_empty() {
                println!();
                println!("Recent log lines:");
                for line in log_tail {
                    println!("  {line}");
                }
            }
        }
    }
}

fn print_help() {
    println!("{PKG_NAME} {VERSION} - deploy and supervise a Caddy reverse proxy");
    println!();
    println!("Usage: caddyctl <command> [options]");
    println!();
    println!("Commands:");
    println!("  deploy        Render config and start the service");
    println!("                  --port <port>        backend port (required)");
    println!("                  --domain <spec>      listen address (default: {DEFAULT_DOMAIN})");
    println!("                  --backend-host <h>   backend host (default: 127.0.0.1)");
    println!("                  --ssl                request HTTPS for public domains");
    println!("                  --config <file>      use a raw Caddyfile instead");
    println!("                  --install            download caddy if missing");
    println!("                  --force-install      re-download caddy first");
    println!("  undeploy      Stop the service and clean up orphans");
    println!("  status        Show whether the service is running");
    println!("  health-check  Run the health battery [--detailed] [--json]");
    println!("  logs          Show service logs [--follow] [--lines N]");
    println!("  diagnose      Detailed health plus recommendations [--json]");
    println!("  install       Download the caddy binary [--force]");
    println!();
    println!("Exit code is 0 on success/healthy, 1 otherwise.");
}
