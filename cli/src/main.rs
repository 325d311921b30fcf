// treadlink: keeps a BLE walking treadmill reachable and controllable
//
// `treadlink serve` owns the connection and exposes the control API; the
// other commands talk to that API or manage local config and history.

mod api;
mod config;
mod logging;
mod power;
mod workouts;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use treadlink_core::{
    AlwaysAttempt, ClientFactory, ConnectGate, ConnectionSupervisor, PadMode, PeripheralAddress,
    SimulatedFactory, SimulatedTreadmill,
};

/// Radio latency of the simulated treadmill
const SIMULATED_LATENCY: Duration = Duration::from_millis(40);

/// How often the host power reading is refreshed
const POWER_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "treadlink")]
#[command(about = "treadlink: walking treadmill connection service", long_about = None)]
#[command(version)]
struct Cli {
    /// Control API address (defaults to the configured listen_addr)
    #[arg(long, global = true)]
    api: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the connection supervisor and control API
    Serve {
        #[arg(short, long)]
        listen: Option<String>,
        /// Use the in-process simulated treadmill
        #[arg(long)]
        simulate: bool,
    },
    /// Show live treadmill status
    Status,
    /// Start a walk
    Start,
    /// Finish the walk and save it
    Stop,
    /// Show or change the treadmill mode
    Mode { mode: Option<String> },
    /// Show supervisor state and counters
    Connection,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List saved walks
    Workouts {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { listen, simulate } => cmd_serve(listen, simulate).await,
        command => {
            logging::init_quiet();
            let base = match cli.api {
                Some(api) => api,
                None => config::Config::load()?.listen_addr,
            };
            run_client(command, &base).await
        }
    }
}

async fn run_client(command: Commands, base: &str) -> Result<()> {
    match command {
        Commands::Status => cmd_status(base).await,
        Commands::Start => cmd_start(base).await,
        Commands::Stop => cmd_stop(base).await,
        Commands::Mode { mode } => cmd_mode(base, mode).await,
        Commands::Connection => cmd_connection(base).await,
        Commands::Config { action } => cmd_config(action),
        Commands::Workouts { limit } => cmd_workouts(limit),
        Commands::Serve { .. } => anyhow::bail!("serve is not a client command"),
    }
}

fn build_factory(
    config: &config::Config,
    address: &PeripheralAddress,
) -> Result<Arc<dyn ClientFactory>> {
    if config.simulate {
        tracing::warn!("Using the simulated treadmill at {}", address);
        let device = SimulatedTreadmill::with_latency(address.clone(), SIMULATED_LATENCY);
        return Ok(SimulatedFactory::new(device));
    }
    anyhow::bail!(
        "No BLE backend is built into this binary; run with --simulate or `treadlink config set simulate true`"
    )
}

async fn build_gate(config: &config::Config) -> Arc<dyn ConnectGate> {
    if config.require_power {
        return power::HostPowerGate::spawn(POWER_POLL_INTERVAL).await;
    }
    Arc::new(AlwaysAttempt)
}

async fn cmd_serve(listen: Option<String>, simulate: bool) -> Result<()> {
    let config_path = config::Config::config_file()?;
    let mut config = config::Config::load_from(&config_path)?;
    if simulate {
        config.simulate = true;
    }

    let _logging = logging::init_logging(
        &config.log_level,
        config.log_dir.as_deref().map(Path::new),
    )?;

    let address = config.effective_address()?;
    let factory = build_factory(&config, &address)?;
    let supervisor_config = config.supervisor.to_supervisor_config();
    let command_timeout = supervisor_config.command_timeout;

    let gate = build_gate(&config).await;
    let supervisor =
        ConnectionSupervisor::with_gate(address.clone(), supervisor_config, factory, gate)
            .context("Failed to create connection supervisor")?;
    supervisor.start_monitoring();

    let workouts_path = config::Config::data_dir()?.join("workouts");
    let workouts = Arc::new(workouts::WorkoutStore::open(workouts_path)?);

    let listen = listen.unwrap_or_else(|| config.listen_addr.clone());
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("Invalid listen address: {}", listen))?;

    println!("{}", "treadlink".bold());
    println!("  Treadmill:   {}", address.to_string().bright_cyan());
    println!("  Control API: {}", format!("http://{}", addr).bright_green());
    if config.simulate {
        println!("  {}", "Simulated treadmill".yellow());
    }
    if config.require_power {
        println!("  {}", "Reconnects only on mains power".dimmed());
    }
    println!();

    let ctx = api::ApiContext {
        supervisor: Arc::clone(&supervisor),
        workouts,
        config_path,
        request_timeout: config.request_timeout(),
        command_timeout,
        last_walk: Mutex::new(None),
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
        tracing::info!("Shutdown requested");
    };

    let served = api::start_api_server(ctx, addr, shutdown).await;
    supervisor.shutdown().await;
    served
}

async fn cmd_status(base: &str) -> Result<()> {
    let status = api::get_status_via_api(base).await?;

    println!("{}", "Treadmill Status".bold());
    println!(
        "  Mode:     {}",
        status.mode.as_deref().unwrap_or("unknown").bright_cyan()
    );
    println!("  Belt:     {}", status.belt_state);
    println!("  Speed:    {:.1} km/h", status.speed);
    println!("  Distance: {:.2} km", status.dist);
    println!("  Time:     {}", format_duration(status.time));
    println!("  Steps:    {}", status.steps);
    Ok(())
}

async fn cmd_start(base: &str) -> Result<()> {
    api::start_walk_via_api(base).await?;
    println!("{} Walk started", "✓".green());
    Ok(())
}

async fn cmd_stop(base: &str) -> Result<()> {
    let walk = api::finish_walk_via_api(base).await?;
    println!("{} Walk saved", "✓".green());
    println!("  Steps:    {}", walk.steps.to_string().bright_cyan());
    println!("  Distance: {:.2} km", walk.distance);
    println!("  Time:     {}", format_duration(walk.time));
    Ok(())
}

async fn cmd_mode(base: &str, mode: Option<String>) -> Result<()> {
    match mode {
        Some(requested) => {
            let mode: PadMode = requested.parse()?;
            let applied = api::set_mode_via_api(base, mode).await?;
            println!("{} Mode set to {}", "✓".green(), applied.bright_cyan());
        }
        None => {
            let current = api::get_mode_via_api(base).await?;
            println!("{}", current.bright_cyan());
        }
    }
    Ok(())
}

async fn cmd_connection(base: &str) -> Result<()> {
    let report = api::get_connection_via_api(base).await?;

    let state = match report.state.as_str() {
        "connected" => report.state.green(),
        "connecting" => report.state.yellow(),
        _ => report.state.red(),
    };

    println!("{}", "Connection".bold());
    println!("  Treadmill:   {}", report.address.bright_cyan());
    println!("  State:       {}", state);
    if let Some(secs) = report.connected_for_secs {
        println!("  Connected:   {}", format_duration(secs as u32));
    }
    println!(
        "  Monitoring:  {}",
        if report.monitoring { "on" } else { "off" }
    );
    if let Some(health) = report.last_health {
        println!("  Last health: {}", health);
    }
    if let Some(reason) = report.last_reset_reason {
        println!("  Last reset:  {}", reason.dimmed());
    }
    println!();
    println!("{}", "Counters".bold());
    let s = report.stats;
    println!("  Scans:            {}", s.scans);
    println!("  Connect attempts: {}", s.connect_attempts);
    println!("  Connects:         {}", s.successful_connects);
    println!("  Forced resets:    {}", s.forced_resets);
    println!("  Health checks:    {}", s.health_checks);
    println!("  Monitor restarts: {}", s.monitor_restarts);
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let path = config::Config::config_file()?;
    let mut config = config::Config::load_from(&path)?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set_and_save(&key, &value, &path)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<26} {}", key.bright_cyan(), value);
            }

            if let Ok(env_address) = std::env::var(config::ADDRESS_ENV) {
                println!();
                println!(
                    "  {} overrides address: {}",
                    config::ADDRESS_ENV.yellow(),
                    env_address
                );
            }
        }
    }

    Ok(())
}

fn cmd_workouts(limit: usize) -> Result<()> {
    let store = workouts::WorkoutStore::open(config::Config::data_dir()?.join("workouts"))?;
    let records = store.recent(limit)?;

    if records.is_empty() {
        println!("{}", "No walks saved yet.".dimmed());
        return Ok(());
    }

    println!("{} ({} total)", "Walks".bold(), store.count());
    println!();
    for record in &records {
        println!(
            "  {} {:>6} steps  {:>6.2} km  {:>3} min",
            record.formatted_time().dimmed(),
            record.steps,
            record.distance_km,
            record.duration_minutes
        );
    }

    let totals = store.totals()?;
    println!();
    println!(
        "  {} {} steps, {:.2} km, {} min over {} walks",
        "Total:".bold(),
        totals.steps,
        totals.distance_km,
        totals.minutes,
        totals.walks
    );
    Ok(())
}

fn format_duration(secs: u32) -> String {
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
