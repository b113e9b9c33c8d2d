mod auth;
mod config;
mod filter;
mod hub;
mod lb;
mod proxy;
mod reqlog;
mod routing;
mod service;
mod usage;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use reqwest::Client;
use tracing_subscriber::EnvFilter;

use crate::config::{ClpPaths, Credential, UpstreamConfig};
use crate::proxy::{ProxyService, router as proxy_router};
use crate::service::ServiceKind;

#[derive(Parser, Debug)]
#[command(name = "clp")]
#[command(about = "Local reverse proxy for Claude/Codex CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy server for one service
    Serve {
        /// Front the Claude API (port 3210 by default)
        #[arg(long)]
        claude: bool,
        /// Front the Codex API (port 3211 by default)
        #[arg(long)]
        codex: bool,
        /// Override the listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show configs and proxy state for both services
    Status,
    /// Manage upstream configs for a service
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
    /// Manage proxy-level auth tokens
    Auth {
        #[command(subcommand)]
        cmd: AuthCommand,
    },
    /// Summarize token usage from the request log
    Usage {
        /// Service to summarize (claude / codex)
        service: String,
        /// How many recent records to aggregate
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Inspect recent request-log entries
    Logs {
        /// Service whose log to read (claude / codex)
        service: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Show one record by id instead of a listing
        #[arg(long)]
        id: Option<String>,
    },
    /// Probe an upstream config with a minimal real request
    Test {
        /// Service to probe (claude / codex)
        service: String,
        /// Config name; defaults to the active config
        #[arg(long)]
        config: Option<String>,
        /// Model to probe with; defaults to a small model for the service
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// List configs for a service
    List { service: String },
    /// Add or replace a config
    Add {
        service: String,
        name: String,
        #[arg(long)]
        base_url: String,
        /// Bearer token credential
        #[arg(long, conflicts_with = "api_key")]
        auth_token: Option<String>,
        /// x-api-key credential
        #[arg(long)]
        api_key: Option<String>,
        /// Weight for weight-based balancing (higher tries first)
        #[arg(long, default_value_t = 0)]
        weight: u32,
        /// Also mark this config active
        #[arg(long)]
        activate: bool,
    },
    /// Mark a config active
    Use { service: String, name: String },
    /// Soft-delete a config (kept on disk, never routed)
    Remove { service: String, name: String },
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// Turn the token gate on
    Enable,
    /// Turn the token gate off
    Disable,
    /// Create a token and print it once
    TokenAdd {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// RFC 3339 expiry; omit for no expiry
        #[arg(long)]
        expires_at: Option<String>,
        /// Restrict to services (repeatable); empty means all
        #[arg(long)]
        service: Vec<String>,
    },
    /// List tokens (values are never reprinted)
    TokenList,
    /// Delete a token by name
    TokenRemove { name: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CLP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let paths = ClpPaths::default_home();
    paths.ensure_dirs()?;

    match cli.command {
        Command::Serve { claude, codex, port } => {
            let service = match (claude, codex) {
                (true, true) => bail!("pick one of --claude / --codex"),
                (true, false) => ServiceKind::Claude,
                (false, true) | (false, false) => ServiceKind::Codex,
            };
            let port = port.unwrap_or_else(|| service.default_port());
            run_server(service, port, &paths).await
        }
        Command::Status => {
            print_status(&paths);
            Ok(())
        }
        Command::Config { cmd } => run_config_command(cmd, &paths),
        Command::Auth { cmd } => run_auth_command(cmd, &paths),
        Command::Usage { service, limit } => run_usage_command(&service, limit, &paths),
        Command::Logs { service, limit, id } => {
            run_logs_command(&service, limit, id.as_deref(), &paths)
        }
        Command::Test {
            service,
            config,
            model,
        } => {
            let Some(service) = ServiceKind::parse(&service) else {
                bail!("unknown service '{service}' (expected claude or codex)");
            };
            let model = model.unwrap_or_else(|| {
                match service {
                    ServiceKind::Claude => "claude-3-5-haiku-latest",
                    ServiceKind::Codex => "gpt-5-mini",
                }
                .to_string()
            });
            run_probe(service, config.as_deref(), &model, &paths).await
        }
    }
}

async fn run_server(service: ServiceKind, port: u16, paths: &ClpPaths) -> anyhow::Result<()> {
    // One shared pool for all upstream traffic. Streams can be long-lived,
    // so only connect and read-idle are bounded.
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .read_timeout(Duration::from_secs(300))
        .pool_max_idle_per_host(100)
        .build()
        .context("build upstream http client")?;

    let proxy = ProxyService::new(client, service, paths);
    let configs = proxy.config_store();
    match configs.get() {
        Ok(snapshot) if snapshot.is_empty() => {
            tracing::warn!(
                "no upstream configs for {service}; requests will fail until {} is populated",
                paths.service_config(service.name()).display()
            );
        }
        Ok(_) => {}
        Err(err) => tracing::warn!("{service}: config file unreadable: {err:#}"),
    }

    let app = proxy_router(proxy);
    let host = std::env::var("CLP_PROXY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr} (is another clp instance running?)"))?;
    tracing::info!("clp listening on http://{addr} (service: {service})");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn print_status(paths: &ClpPaths) {
    println!("state dir: {}", paths.root().display().dimmed());
    for service in [ServiceKind::Claude, ServiceKind::Codex] {
        let store = crate::config::ConfigStore::new(service.name(), paths);
        println!("{} proxy (port {}):", service.name().bold(), service.default_port());
        match store.get() {
            Ok(snapshot) => {
                if snapshot.is_empty() {
                    println!("  {}", "no configs".yellow());
                } else {
                    let active = snapshot.active_config().map(|c| c.name.clone());
                    let mut names: Vec<_> = snapshot.configs.keys().cloned().collect();
                    names.sort();
                    for name in names {
                        let cfg = &snapshot.configs[&name];
                        let marker = if Some(&name) == active.as_ref() {
                            "*".green().to_string()
                        } else {
                            " ".to_string()
                        };
                        println!(
                            "  {marker} {name}  weight={}  {}",
                            cfg.weight,
                            cfg.base_url.dimmed()
                        );
                    }
                }
            }
            Err(err) => println!("  {}", format!("config unreadable: {err:#}").red()),
        }
    }

    let auth = crate::auth::AuthManager::new(paths);
    let enabled = auth.config().enabled;
    println!(
        "auth gate: {}",
        if enabled {
            "enabled".green().to_string()
        } else {
            "disabled".dimmed().to_string()
        }
    );
}

fn run_config_command(cmd: ConfigCommand, paths: &ClpPaths) -> anyhow::Result<()> {
    fn store_for(service: &str, paths: &ClpPaths) -> anyhow::Result<crate::config::ConfigStore> {
        let Some(kind) = ServiceKind::parse(service) else {
            bail!("unknown service '{service}' (expected claude or codex)");
        };
        Ok(crate::config::ConfigStore::new(kind.name(), paths))
    }

    match cmd {
        ConfigCommand::List { service } => {
            let store = store_for(&service, paths)?;
            let snapshot = store.get()?;
            if snapshot.is_empty() {
                println!("no configs for {service}");
                return Ok(());
            }
            let active = snapshot.active_config().map(|c| c.name.clone());
            let mut names: Vec<_> = snapshot.configs.keys().cloned().collect();
            names.sort();
            for name in names {
                let cfg = &snapshot.configs[&name];
                let marker = if Some(&name) == active.as_ref() { "*" } else { " " };
                println!("{marker} {name}  weight={}  {}", cfg.weight, cfg.base_url);
            }
            Ok(())
        }
        ConfigCommand::Add {
            service,
            name,
            base_url,
            auth_token,
            api_key,
            weight,
            activate,
        } => {
            let store = store_for(&service, paths)?;
            store.upsert(UpstreamConfig {
                name: name.clone(),
                base_url,
                auth_token: auth_token.unwrap_or_default(),
                api_key,
                weight,
                active: false,
                deleted: false,
                deleted_at: None,
            })?;
            if activate {
                store.set_active(&name)?;
            }
            println!("saved config '{name}' for {service}");
            Ok(())
        }
        ConfigCommand::Use { service, name } => {
            let store = store_for(&service, paths)?;
            store.set_active(&name)?;
            println!("activated '{name}' for {service}");
            Ok(())
        }
        ConfigCommand::Remove { service, name } => {
            let store = store_for(&service, paths)?;
            store.soft_delete(&name)?;
            println!("removed '{name}' from {service} (soft delete)");
            Ok(())
        }
    }
}

fn run_auth_command(cmd: AuthCommand, paths: &ClpPaths) -> anyhow::Result<()> {
    let auth = crate::auth::AuthManager::new(paths);
    match cmd {
        AuthCommand::Enable => {
            auth.set_enabled(true)?;
            println!("auth gate enabled");
            Ok(())
        }
        AuthCommand::Disable => {
            auth.set_enabled(false)?;
            println!("auth gate disabled");
            Ok(())
        }
        AuthCommand::TokenAdd {
            name,
            description,
            expires_at,
            service,
        } => {
            let token = auth.add_token(&name, &description, expires_at, service)?;
            println!("token '{name}' created. Store it now; it is not shown again:");
            println!("  {token}");
            Ok(())
        }
        AuthCommand::TokenList => {
            let tokens = auth.list_tokens();
            if tokens.is_empty() {
                println!("no tokens");
                return Ok(());
            }
            for entry in tokens {
                let state = if entry.active { "active" } else { "disabled" };
                let scope = if entry.services.is_empty() {
                    "all services".to_string()
                } else {
                    entry.services.join(",")
                };
                println!(
                    "{}  {state}  {scope}  expires={}",
                    entry.name,
                    entry.expires_at.as_deref().unwrap_or("never")
                );
            }
            Ok(())
        }
        AuthCommand::TokenRemove { name } => {
            auth.remove_token(&name)?;
            println!("token '{name}' removed");
            Ok(())
        }
    }
}

fn run_usage_command(service: &str, limit: usize, paths: &ClpPaths) -> anyhow::Result<()> {
    let Some(kind) = ServiceKind::parse(service) else {
        bail!("unknown service '{service}' (expected claude or codex)");
    };
    let log = crate::reqlog::RequestLog::new(kind.name(), paths);
    let records = log.list(limit);
    if records.is_empty() {
        println!("no logged requests for {service}");
        return Ok(());
    }

    let mut totals = crate::usage::UsageTotals::default();
    let mut per_channel: std::collections::BTreeMap<String, crate::usage::UsageTotals> =
        std::collections::BTreeMap::new();
    for record in &records {
        let u = record.usage;
        totals.input += u.input;
        totals.cached_create += u.cached_create;
        totals.cached_read += u.cached_read;
        totals.output += u.output;
        totals.reasoning += u.reasoning;
        totals.total += u.total;
        let channel = record.channel.clone().unwrap_or_else(|| "-".to_string());
        let entry = per_channel.entry(channel).or_default();
        entry.input += u.input;
        entry.output += u.output;
        entry.total += u.total;
    }

    // display numbers apply the per-service projection; the log keeps raw
    let shown = crate::usage::display_totals(kind, totals);
    println!(
        "{} over last {} requests:",
        service.bold(),
        records.len()
    );
    println!(
        "  input={} cached_read={} cached_create={} output={} reasoning={} total={}",
        shown.input, shown.cached_read, shown.cached_create, shown.output, shown.reasoning, shown.total
    );
    for (channel, u) in per_channel {
        let shown = crate::usage::display_totals(kind, u);
        println!(
            "  {channel}: input={} output={} total={}",
            shown.input, shown.output, shown.total
        );
    }
    Ok(())
}

fn run_logs_command(
    service: &str,
    limit: usize,
    id: Option<&str>,
    paths: &ClpPaths,
) -> anyhow::Result<()> {
    let Some(kind) = ServiceKind::parse(service) else {
        bail!("unknown service '{service}' (expected claude or codex)");
    };
    let log = crate::reqlog::RequestLog::new(kind.name(), paths);

    if let Some(id) = id {
        let Some(record) = log.get(id) else {
            bail!("no record with id '{id}' in the last {} entries", log.len());
        };
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let records = log.list(limit);
    if records.is_empty() {
        println!("no logged requests for {service}");
        return Ok(());
    }
    for record in records {
        let channel = record.channel.as_deref().unwrap_or("-");
        let marker = if record.blocked {
            "blocked".red().to_string()
        } else if record.status_code < 400 {
            record.status_code.to_string().green().to_string()
        } else {
            record.status_code.to_string().red().to_string()
        };
        println!(
            "{}  {}  {} {}  {}  {}ms  channel={channel}  tokens={}",
            record.timestamp.dimmed(),
            record.id,
            record.client_method,
            record.client_path,
            marker,
            record.duration_ms,
            record.usage.total
        );
    }
    Ok(())
}

async fn run_probe(
    service: ServiceKind,
    config: Option<&str>,
    model: &str,
    paths: &ClpPaths,
) -> anyhow::Result<()> {
    let store = crate::config::ConfigStore::new(service.name(), paths);
    let snapshot = store.get()?;
    let cfg = match config {
        Some(name) => snapshot
            .configs
            .get(name)
            .with_context(|| format!("config '{name}' not found for {service}"))?,
        None => snapshot
            .active_config()
            .context("no configs to probe; add one with `clp config add`")?,
    };

    let (path, body) = service.probe_request(model);
    let url = format!("{}{path}", cfg.base_url.trim_end_matches('/'));
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(60))
        .build()?;
    let mut request = client.post(&url).json(&body);
    match cfg.credential() {
        Some(Credential::Bearer(token)) => {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        Some(Credential::ApiKey(key)) => {
            request = request.header("x-api-key", key);
        }
        None => {}
    }

    let started = Instant::now();
    match request.send().await {
        Ok(response) => {
            let status = response.status();
            let elapsed = started.elapsed().as_millis();
            let line = format!("{} {} in {}ms", cfg.name, status, elapsed);
            if status.is_success() {
                println!("{}", line.green());
            } else {
                println!("{}", line.red());
                let text = response.text().await.unwrap_or_default();
                if !text.is_empty() {
                    println!("{}", text.chars().take(500).collect::<String>().dimmed());
                }
            }
            Ok(())
        }
        Err(err) => {
            println!("{}", format!("{}: {err}", cfg.name).red());
            Ok(())
        }
    }
}
