mod auth;
mod backbone;
mod client;
mod config;
mod dispatcher;
mod envelope;
mod gateway_server;
mod hub;
mod producer;
mod runtime;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use auth::JwtVerifier;
use clap::{Args, Parser, Subcommand};
use config::{BackboneKind, Config, LogFormat, DEV_JWT_SECRET};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Authenticated WebSocket relay over a partitioned log")]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true, env = "WSRELAY_CONFIG", default_value = "wsrelay.toml")]
    config: PathBuf,

    /// Override the WebSocket listen address.
    #[arg(long, global = true, env = "WSRELAY_BIND")]
    bind: Option<String>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "WSRELAY_LOG", default_value = "info")]
    log: String,

    /// Log output format: text or json.
    #[arg(long, global = true, value_parser = parse_log_format_arg)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the gateway and backbone dispatcher.
    Run,
    /// Check configuration without starting listeners.
    Doctor(DoctorArgs),
    /// Mint a token signed with the configured secret.
    Token(TokenArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct TokenArgs {
    /// Identity to place in the `sub` claim.
    #[arg(long)]
    sub: String,
    /// Lifetime of the token in seconds.
    #[arg(long, default_value_t = 3600)]
    ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.clone().unwrap_or(CliCommand::Run);
    match command {
        CliCommand::Run => run_gateway(cli).await,
        CliCommand::Doctor(args) => {
            init_logging(&cli.log, cli.log_format.unwrap_or_default())?;
            run_doctor(&cli.config, args)
        }
        CliCommand::Token(args) => run_token(&cli.config, args),
    }
}

async fn run_gateway(cli: Cli) -> Result<()> {
    let mut cfg = Config::from_file(&cli.config)?;
    let format = cli
        .log_format
        .or_else(config::log_format_from_env)
        .unwrap_or(cfg.log.format);
    init_logging(&cli.log, format)?;
    cfg.apply_env_overrides();
    cfg.apply_cli_overrides(cli.bind.as_deref(), cli.log_format);
    cfg.validate()?;
    runtime::GatewayRuntime::new(cfg).run().await
}

fn run_doctor(config_path: &Path, args: DoctorArgs) -> Result<()> {
    let config_result = Config::load(config_path).map_err(|err| format!("{err:#}"));
    let report = build_doctor_report(config_result, config_path);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

fn run_token(config_path: &Path, args: TokenArgs) -> Result<()> {
    let cfg = Config::load(config_path)?;
    let subject = args.sub.trim();
    if subject.is_empty() {
        anyhow::bail!("--sub must not be empty");
    }
    let verifier = JwtVerifier::new(
        &cfg.auth.jwt_secret,
        &cfg.auth.jwt_issuer,
        &cfg.auth.jwt_audience,
        cfg.auth.leeway(),
    );
    println!(
        "{}",
        verifier.mint(subject, Duration::from_secs(args.ttl_secs))?
    );
    Ok(())
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
) -> DoctorReport {
    let mut checks = Vec::new();

    match config_result {
        Ok(cfg) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message: format!("loaded {}", config_path.display()),
                detail: None,
            });
            push_config_checks(&mut checks, &cfg);
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: format!("failed to load {}", config_path.display()),
                detail: Some(err),
            });
        }
    }

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn push_config_checks(checks: &mut Vec<DoctorCheck>, cfg: &Config) {
    checks.push(DoctorCheck {
        id: "server.listen".to_owned(),
        status: "pass".to_owned(),
        message: format!("ws://{}{}", cfg.server.bind, cfg.server.path),
        detail: cfg
            .server
            .http_bind
            .as_ref()
            .map(|bind| format!("control-http on {bind}")),
    });

    let dev_secret = cfg.auth.jwt_secret == DEV_JWT_SECRET;
    checks.push(DoctorCheck {
        id: "auth.jwt_secret".to_owned(),
        status: if dev_secret { "warn" } else { "pass" }.to_owned(),
        message: if dev_secret {
            "using development secret".to_owned()
        } else {
            "custom secret configured".to_owned()
        },
        detail: Some(format!(
            "issuer={} audience={} leeway={}s",
            display_or_none(&cfg.auth.jwt_issuer),
            display_or_none(&cfg.auth.jwt_audience),
            cfg.auth.jwt_leeway_secs
        )),
    });

    let kafka_enabled = cfg!(feature = "kafka");
    let kafka_selected = cfg.backbone.kind == BackboneKind::Kafka;
    checks.push(DoctorCheck {
        id: "backbone.kind".to_owned(),
        status: if kafka_selected && !kafka_enabled {
            "fail"
        } else {
            "pass"
        }
        .to_owned(),
        message: format!(
            "{:?} topic={} group={} ({:?})",
            cfg.backbone.kind, cfg.backbone.topic, cfg.backbone.group, cfg.backbone.group_mode
        ),
        detail: Some(if kafka_selected {
            format!(
                "brokers={} feature kafka enabled={kafka_enabled}",
                cfg.backbone.brokers.join(",")
            )
        } else {
            "in-process log; delivery is local to this instance".to_owned()
        }),
    });
}

fn display_or_none(value: &str) -> &str {
    if value.is_empty() {
        "<unchecked>"
    } else {
        value
    }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

fn parse_log_format_arg(raw: &str) -> std::result::Result<LogFormat, String> {
    config::parse_log_format(raw).ok_or_else(|| format!("unknown log format {raw:?}"))
}

fn init_logging(filter: &str, format: LogFormat) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(env)
            .with_target(false)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env)
            .with_current_span(false)
            .init(),
    }
    Ok(())
}
