// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Kube Tunnel Manager Contributors

// Kube Tunnel Manager - CLI Client
// Command-line interface for managing cluster tunnels

mod config;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use dialoguer::{Confirm, Input};
use reqwest::Client;
use serde::Deserialize;

use kube_tunnel_common::{
    add_auth_header, create_daemon_client, DaemonClientConfig, DaemonTunnelEvent, EventListener,
    ServiceInfo, StageStatus, TunnelConfig, TunnelStatusResponse, Uuid,
};

use config::CliConfig;

#[derive(Parser)]
#[command(name = "kube-tunnel")]
#[command(about = "Kube Tunnel Manager CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new tunnel
    Add {
        /// Tunnel name
        name: String,

        /// Cluster namespace
        #[arg(short = 'n', long)]
        namespace: Option<String>,

        /// Service to forward to
        #[arg(short = 's', long)]
        service: Option<String>,

        /// Local port to bind
        #[arg(short = 'l', long)]
        local_port: Option<u16>,

        /// Service port to forward to
        #[arg(short = 'r', long)]
        remote_port: Option<u16>,

        /// Relay listen port (enables the relay stage)
        #[arg(short = 'p', long)]
        proxy_port: Option<u16>,

        /// Multi-connection mode: one upstream session per inbound client
        #[arg(long)]
        direct_exec: bool,

        /// Create the tunnel disabled
        #[arg(long)]
        disabled: bool,

        /// Do not reconnect automatically on failure
        #[arg(long)]
        no_auto_reconnect: bool,

        /// Skip interactive prompts (use provided args only)
        #[arg(short = 'y', long)]
        non_interactive: bool,
    },

    /// List all tunnels
    List {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Delete a tunnel
    Delete {
        /// Tunnel name
        name: String,
    },

    /// Show detailed information about a tunnel
    Info {
        /// Tunnel name
        name: String,
    },

    /// Start a tunnel
    Start {
        /// Tunnel name
        name: String,
    },

    /// Stop a tunnel
    Stop {
        /// Tunnel name
        name: String,
    },

    /// Restart a tunnel
    Restart {
        /// Tunnel name
        name: String,
    },

    /// Show tunnel status
    Status {
        /// Tunnel name (optional, shows all if not specified)
        name: Option<String>,
    },

    /// Enable a tunnel
    Enable {
        /// Tunnel name
        name: String,
    },

    /// Disable a tunnel
    Disable {
        /// Tunnel name
        name: String,
    },

    /// Follow tunnel events from the daemon
    Watch {
        /// Optional tunnel name to filter by
        name: Option<String>,
    },

    /// List cluster namespaces
    Namespaces,

    /// List services in a namespace
    Services {
        /// Namespace to query
        namespace: String,
    },

    /// Daemon management
    Daemon {
        #[command(subcommand)]
        action: DaemonCommands,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start the daemon in the background
    Start,
    /// Stop the daemon
    Stop,
    /// Check daemon status
    Status,
}

#[derive(Debug, Deserialize)]
struct TunnelDetail {
    config: TunnelConfig,
    status: TunnelStatusResponse,
}

#[derive(Debug, Deserialize)]
struct TunnelsListResponse {
    tunnels: Vec<TunnelDetail>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Add {
            name,
            namespace,
            service,
            local_port,
            remote_port,
            proxy_port,
            direct_exec,
            disabled,
            no_auto_reconnect,
            non_interactive,
        } => {
            add_tunnel(
                name,
                namespace,
                service,
                local_port,
                remote_port,
                proxy_port,
                direct_exec,
                disabled,
                no_auto_reconnect,
                non_interactive,
            )
            .await
        }
        Commands::List { json } => list_tunnels(json).await,
        Commands::Delete { name } => delete_tunnel(name).await,
        Commands::Info { name } => show_tunnel_info(name).await,
        Commands::Start { name } => start_tunnel(name).await,
        Commands::Stop { name } => stop_tunnel(name).await,
        Commands::Restart { name } => restart_tunnel(name).await,
        Commands::Status { name } => show_status(name).await,
        Commands::Enable { name } => set_enabled(name, true).await,
        Commands::Disable { name } => set_enabled(name, false).await,
        Commands::Watch { name } => watch_events(name).await,
        Commands::Namespaces => list_namespaces().await,
        Commands::Services { namespace } => list_services(namespace).await,
        Commands::Daemon { action } => match action {
            DaemonCommands::Start => daemon_start(),
            DaemonCommands::Stop => daemon_stop(),
            DaemonCommands::Status => daemon_status().await,
        },
    }
}

/// Load CLI config and build a client for the daemon
fn connect() -> Result<(DaemonClientConfig, Client, String)> {
    let config = CliConfig::load()?.daemon_config;
    let client = create_daemon_client(&config)?;
    let base_url = config.daemon_base_url()?;
    Ok((config, client, base_url))
}

async fn fetch_tunnels(
    client: &Client,
    config: &DaemonClientConfig,
    base_url: &str,
) -> Result<Vec<TunnelDetail>> {
    let response = add_auth_header(client.get(format!("{}/api/tunnels", base_url)), config)
        .send()
        .await
        .context("Failed to reach the daemon. Is it running? (kube-tunnel daemon start)")?;

    if !response.status().is_success() {
        anyhow::bail!("Daemon returned {}", response.status());
    }

    let list: TunnelsListResponse = response
        .json()
        .await
        .context("Failed to parse tunnel list")?;
    Ok(list.tunnels)
}

async fn find_tunnel(
    client: &Client,
    config: &DaemonClientConfig,
    base_url: &str,
    name: &str,
) -> Result<TunnelDetail> {
    fetch_tunnels(client, config, base_url)
        .await?
        .into_iter()
        .find(|t| t.config.name == name)
        .ok_or_else(|| anyhow::anyhow!("Tunnel '{}' not found", name))
}

/// Bail with the daemon's error body when a request fails
async fn expect_success(response: reqwest::Response, action: &str) -> Result<()> {
    if response.status().is_success() {
        return Ok(());
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("Failed to {}: {} - {}", action, status, body)
}

#[allow(clippy::too_many_arguments)]
async fn add_tunnel(
    name: String,
    namespace: Option<String>,
    service: Option<String>,
    local_port: Option<u16>,
    remote_port: Option<u16>,
    proxy_port: Option<u16>,
    direct_exec: bool,
    disabled: bool,
    no_auto_reconnect: bool,
    non_interactive: bool,
) -> Result<()> {
    let namespace = prompt_if_missing(namespace, "Namespace", non_interactive)?;
    let service = prompt_if_missing(service, "Service", non_interactive)?;
    let local_port = prompt_port_if_missing(local_port, "Local port", non_interactive)?;
    let remote_port = prompt_port_if_missing(remote_port, "Remote port", non_interactive)?;

    let mut tunnel = TunnelConfig::new(name, namespace, service, local_port, remote_port);
    tunnel.proxy_port = proxy_port;
    tunnel.use_direct_exec = direct_exec;
    tunnel.enabled = !disabled;
    tunnel.auto_reconnect = !no_auto_reconnect;

    tunnel
        .validate()
        .context("Invalid tunnel configuration")?;

    let (config, client, base_url) = connect()?;
    let response = add_auth_header(client.post(format!("{}/api/tunnels", base_url)), &config)
        .json(&tunnel)
        .send()
        .await
        .context("Failed to reach the daemon. Is it running? (kube-tunnel daemon start)")?;
    expect_success(response, "create tunnel").await?;

    println!(
        "{} Tunnel '{}' created ({}/{} -> 127.0.0.1:{})",
        "✓".green().bold(),
        tunnel.name.bold(),
        tunnel.namespace,
        tunnel.service,
        tunnel.local_port
    );
    Ok(())
}

fn prompt_if_missing(value: Option<String>, prompt: &str, non_interactive: bool) -> Result<String> {
    match value {
        Some(v) => Ok(v),
        None if non_interactive => anyhow::bail!("{} is required in non-interactive mode", prompt),
        None => Ok(Input::new().with_prompt(prompt).interact_text()?),
    }
}

fn prompt_port_if_missing(value: Option<u16>, prompt: &str, non_interactive: bool) -> Result<u16> {
    match value {
        Some(v) => Ok(v),
        None if non_interactive => anyhow::bail!("{} is required in non-interactive mode", prompt),
        None => Ok(Input::new().with_prompt(prompt).interact_text()?),
    }
}

async fn list_tunnels(json: bool) -> Result<()> {
    let (config, client, base_url) = connect()?;
    let tunnels = fetch_tunnels(&client, &config, &base_url).await?;

    if json {
        let configs: Vec<&TunnelConfig> = tunnels.iter().map(|t| &t.config).collect();
        println!("{}", serde_json::to_string_pretty(&configs)?);
        return Ok(());
    }

    if tunnels.is_empty() {
        println!("No tunnels configured. Create one with: kube-tunnel add <name>");
        return Ok(());
    }

    print_tunnels_table(&tunnels);
    Ok(())
}

fn print_tunnels_table(tunnels: &[TunnelDetail]) {
    let mut table = Table::new();
    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").add_attribute(Attribute::Bold),
            Cell::new("Target").add_attribute(Attribute::Bold),
            Cell::new("Local").add_attribute(Attribute::Bold),
            Cell::new("Relay").add_attribute(Attribute::Bold),
            Cell::new("Mode").add_attribute(Attribute::Bold),
            Cell::new("Enabled").add_attribute(Attribute::Bold),
            Cell::new("Status").add_attribute(Attribute::Bold),
        ]);

    for tunnel in tunnels {
        let config = &tunnel.config;
        table.add_row(vec![
            Cell::new(&config.name),
            Cell::new(format!(
                "{}/{}:{}",
                config.namespace, config.service, config.remote_port
            )),
            Cell::new(config.local_port),
            Cell::new(
                config
                    .proxy_port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(if config.use_direct_exec {
                "direct-exec"
            } else {
                "standard"
            }),
            Cell::new(if config.enabled { "yes" } else { "no" }),
            status_cell(&tunnel.status),
        ]);
    }

    println!("{table}");
}

fn status_cell(status: &TunnelStatusResponse) -> Cell {
    if status.fully_connected {
        Cell::new("connected").fg(Color::Green)
    } else {
        match status.forward_status {
            StageStatus::Connecting => Cell::new("connecting").fg(Color::Yellow),
            StageStatus::Error => Cell::new("error").fg(Color::Red),
            StageStatus::Connected => Cell::new("relay pending").fg(Color::Yellow),
            StageStatus::Disconnected => Cell::new("disconnected").fg(Color::DarkGrey),
        }
    }
}

async fn delete_tunnel(name: String) -> Result<()> {
    let (config, client, base_url) = connect()?;
    let tunnel = find_tunnel(&client, &config, &base_url, &name).await?;

    let confirmed = Confirm::new()
        .with_prompt(format!("Delete tunnel '{}'?", name))
        .default(false)
        .interact()?;
    if !confirmed {
        println!("Aborted");
        return Ok(());
    }

    let response = add_auth_header(
        client.delete(format!("{}/api/tunnels/{}", base_url, tunnel.config.id)),
        &config,
    )
    .send()
    .await?;
    expect_success(response, "delete tunnel").await?;

    println!("{} Tunnel '{}' deleted", "✓".green().bold(), name.bold());
    Ok(())
}

async fn show_tunnel_info(name: String) -> Result<()> {
    let (config, client, base_url) = connect()?;
    let tunnel = find_tunnel(&client, &config, &base_url, &name).await?;
    let cfg = &tunnel.config;
    let status = &tunnel.status;

    println!("{}", cfg.name.bold());
    println!("  ID:             {}", cfg.id);
    println!("  Namespace:      {}", cfg.namespace);
    println!("  Service:        {}", cfg.service);
    println!("  Local port:     {}", cfg.local_port);
    println!("  Remote port:    {}", cfg.remote_port);
    match cfg.proxy_port {
        Some(port) => println!("  Relay port:     {}", port),
        None => println!("  Relay port:     -"),
    }
    println!(
        "  Mode:           {}",
        if cfg.use_direct_exec { "direct-exec" } else { "standard" }
    );
    println!("  Enabled:        {}", cfg.enabled);
    println!("  Auto-reconnect: {}", cfg.auto_reconnect);
    println!("  Forward status: {}", format_stage(status.forward_status));
    println!("  Relay status:   {}", format_stage(status.relay_status));
    if let Some(error) = &status.last_error {
        println!("  Last error:     {}", error.red());
    }

    Ok(())
}

fn format_stage(status: StageStatus) -> String {
    match status {
        StageStatus::Connected => "connected".green().to_string(),
        StageStatus::Connecting => "connecting".yellow().to_string(),
        StageStatus::Error => "error".red().to_string(),
        StageStatus::Disconnected => "disconnected".dimmed().to_string(),
    }
}

async fn start_tunnel(name: String) -> Result<()> {
    let (config, client, base_url) = connect()?;
    let tunnel = find_tunnel(&client, &config, &base_url, &name).await?;
    let id = tunnel.config.id;

    let response = add_auth_header(
        client.post(format!("{}/api/tunnels/{}/start", base_url, id)),
        &config,
    )
    .send()
    .await?;
    expect_success(response, "start tunnel").await?;

    println!("Starting tunnel '{}'...", name);
    wait_until_connected(&client, &config, &base_url, id, &name, tunnel.config.local_port).await
}

/// Poll tunnel status until it settles into connected or error
async fn wait_until_connected(
    client: &Client,
    config: &DaemonClientConfig,
    base_url: &str,
    id: Uuid,
    name: &str,
    local_port: u16,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);

    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(500)).await;

        let response = add_auth_header(
            client.get(format!("{}/api/tunnels/{}/status", base_url, id)),
            config,
        )
        .send()
        .await?;
        if !response.status().is_success() {
            continue;
        }

        let status: TunnelStatusResponse = response.json().await?;
        if status.fully_connected {
            println!(
                "{} Tunnel '{}' connected on 127.0.0.1:{}",
                "✓".green().bold(),
                name.bold(),
                local_port
            );
            return Ok(());
        }
        if status.forward_status == StageStatus::Error || status.relay_status == StageStatus::Error
        {
            let reason = status
                .last_error
                .unwrap_or_else(|| "unknown error".to_string());
            anyhow::bail!("Tunnel failed: {}", reason);
        }
    }

    anyhow::bail!("Timed out waiting for tunnel '{}' to connect", name)
}

async fn stop_tunnel(name: String) -> Result<()> {
    let (config, client, base_url) = connect()?;
    let tunnel = find_tunnel(&client, &config, &base_url, &name).await?;

    let response = add_auth_header(
        client.post(format!("{}/api/tunnels/{}/stop", base_url, tunnel.config.id)),
        &config,
    )
    .send()
    .await?;
    expect_success(response, "stop tunnel").await?;

    println!("{} Tunnel '{}' stopped", "✓".green().bold(), name.bold());
    Ok(())
}

async fn restart_tunnel(name: String) -> Result<()> {
    let (config, client, base_url) = connect()?;
    let tunnel = find_tunnel(&client, &config, &base_url, &name).await?;
    let id = tunnel.config.id;

    let response = add_auth_header(
        client.post(format!("{}/api/tunnels/{}/restart", base_url, id)),
        &config,
    )
    .send()
    .await?;
    expect_success(response, "restart tunnel").await?;

    println!("Restarting tunnel '{}'...", name);
    wait_until_connected(&client, &config, &base_url, id, &name, tunnel.config.local_port).await
}

async fn show_status(name: Option<String>) -> Result<()> {
    let (config, client, base_url) = connect()?;

    match name {
        Some(name) => {
            let tunnel = find_tunnel(&client, &config, &base_url, &name).await?;
            print_tunnels_table(std::slice::from_ref(&tunnel));
        }
        None => {
            let tunnels = fetch_tunnels(&client, &config, &base_url).await?;
            if tunnels.is_empty() {
                println!("No tunnels configured");
                return Ok(());
            }
            print_tunnels_table(&tunnels);
        }
    }

    Ok(())
}

async fn set_enabled(name: String, enabled: bool) -> Result<()> {
    let (config, client, base_url) = connect()?;
    let mut tunnel = find_tunnel(&client, &config, &base_url, &name).await?.config;
    tunnel.enabled = enabled;

    let response = add_auth_header(
        client.put(format!("{}/api/tunnels/{}", base_url, tunnel.id)),
        &config,
    )
    .json(&tunnel)
    .send()
    .await?;
    expect_success(response, "update tunnel").await?;

    println!(
        "{} Tunnel '{}' {}",
        "✓".green().bold(),
        name.bold(),
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

async fn watch_events(name: Option<String>) -> Result<()> {
    let (config, client, base_url) = connect()?;

    // Resolve the optional name filter to an id up front
    let filter_id = match &name {
        Some(name) => Some(find_tunnel(&client, &config, &base_url, name).await?.config.id),
        None => None,
    };

    println!("Watching tunnel events (Ctrl+C to exit)...");

    let listener = EventListener::new(config);
    let mut events = listener.listen().await?;

    while let Some(event) = events.recv().await {
        let id = match &event {
            DaemonTunnelEvent::Starting { id }
            | DaemonTunnelEvent::Connected { id }
            | DaemonTunnelEvent::Disconnected { id, .. }
            | DaemonTunnelEvent::Error { id, .. } => Some(*id),
            DaemonTunnelEvent::AllReady | DaemonTunnelEvent::Heartbeat { .. } => None,
        };

        if let (Some(filter), Some(id)) = (filter_id, id) {
            if id != filter {
                continue;
            }
        }

        match event {
            DaemonTunnelEvent::Starting { id } => {
                println!("{} {} starting", "→".yellow(), id);
            }
            DaemonTunnelEvent::Connected { id } => {
                println!("{} {} connected", "✓".green().bold(), id);
            }
            DaemonTunnelEvent::Disconnected { id, reason } => {
                println!("{} {} disconnected: {}", "✗".red().bold(), id, reason);
            }
            DaemonTunnelEvent::Error { id, error } => {
                println!("{} {} error: {}", "✗".red().bold(), id, error.red());
            }
            DaemonTunnelEvent::AllReady => {
                println!("{} all tunnels ready", "✓".green().bold());
            }
            DaemonTunnelEvent::Heartbeat { .. } => {}
        }
    }

    Ok(())
}

async fn list_namespaces() -> Result<()> {
    let (config, client, base_url) = connect()?;

    let response = add_auth_header(client.get(format!("{}/api/namespaces", base_url)), &config)
        .send()
        .await
        .context("Failed to reach the daemon. Is it running?")?;
    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Namespace discovery failed: {}", body);
    }

    let namespaces: Vec<String> = response.json().await?;
    for namespace in namespaces {
        println!("{}", namespace);
    }
    Ok(())
}

async fn list_services(namespace: String) -> Result<()> {
    let (config, client, base_url) = connect()?;

    let response = add_auth_header(
        client.get(format!("{}/api/namespaces/{}/services", base_url, namespace)),
        &config,
    )
    .send()
    .await
    .context("Failed to reach the daemon. Is it running?")?;
    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Service discovery failed: {}", body);
    }

    let services: Vec<ServiceInfo> = response.json().await?;
    if services.is_empty() {
        println!("No services in namespace '{}'", namespace);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Service").add_attribute(Attribute::Bold),
            Cell::new("Type").add_attribute(Attribute::Bold),
            Cell::new("Cluster IP").add_attribute(Attribute::Bold),
            Cell::new("Ports").add_attribute(Attribute::Bold),
        ]);

    for service in services {
        let ports = service
            .ports
            .iter()
            .map(|p| match &p.name {
                Some(name) => format!("{}:{}", name, p.port),
                None => p.port.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            Cell::new(service.name),
            Cell::new(service.service_type),
            Cell::new(service.cluster_ip.unwrap_or_else(|| "-".to_string())),
            Cell::new(ports),
        ]);
    }

    println!("{table}");
    Ok(())
}

fn daemon_start() -> Result<()> {
    let child = std::process::Command::new("kube-tunnel-daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("Failed to launch kube-tunnel-daemon. Is it installed and on PATH?")?;

    println!(
        "{} Daemon starting (pid {})",
        "✓".green().bold(),
        child.id()
    );
    Ok(())
}

fn daemon_stop() -> Result<()> {
    let pid_path = dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .map(|dir| dir.join("kube-tunnel-manager").join("daemon.pid"))
        .ok_or_else(|| anyhow::anyhow!("Could not determine runtime directory"))?;

    let pid = std::fs::read_to_string(&pid_path)
        .context("Daemon does not appear to be running (no PID file)")?
        .trim()
        .to_string();

    let status = std::process::Command::new("kill")
        .arg(&pid)
        .status()
        .context("Failed to run kill")?;

    if status.success() {
        println!("{} Sent shutdown signal to daemon (pid {})", "✓".green().bold(), pid);
        Ok(())
    } else {
        anyhow::bail!("Failed to signal daemon process {}", pid)
    }
}

async fn daemon_status() -> Result<()> {
    let (config, client, base_url) = connect()?;

    match add_auth_header(client.get(format!("{}/api/health", base_url)), &config)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            println!("{} Daemon is running", "✓".green().bold());
            Ok(())
        }
        Ok(response) => {
            anyhow::bail!("Daemon responded with {}", response.status())
        }
        Err(_) => {
            println!("{} Daemon is not running", "✗".red().bold());
            Ok(())
        }
    }
}
